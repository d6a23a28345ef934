use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::biomarker::BiomarkerCategory;
use crate::{Error, Result};

/// One canonical biomarker name and the spellings that map to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub canonical: String,
    pub category: BiomarkerCategory,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl VocabularyEntry {
    fn new(canonical: &str, category: BiomarkerCategory, aliases: &[&str]) -> Self {
        Self {
            canonical: canonical.to_string(),
            category,
            aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    fn spellings(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

static BUILTIN: LazyLock<Vec<VocabularyEntry>> = LazyLock::new(|| {
    use BiomarkerCategory::{
        Blood, Hormone, Kidney, Lipid, Liver, Metabolic, Mineral, Other, Thyroid, Vitamin,
    };
    vec![
        VocabularyEntry::new(
            "Total Cholesterol",
            Lipid,
            &["Cholesterol", "Cholesterol, Total", "Cholesterol Total"],
        ),
        VocabularyEntry::new(
            "HDL Cholesterol",
            Lipid,
            &["HDL", "HDL-C", "HDL-Cholesterol", "HDL Chol"],
        ),
        VocabularyEntry::new(
            "LDL Cholesterol",
            Lipid,
            &["LDL", "LDL-C", "LDL-Cholesterol", "LDL Calculated", "LDL Chol"],
        ),
        VocabularyEntry::new("VLDL Cholesterol", Lipid, &["VLDL", "VLDL-C"]),
        VocabularyEntry::new(
            "Non-HDL Cholesterol",
            Lipid,
            &["Non-HDL", "Non HDL Cholesterol", "Non-HDL-C"],
        ),
        VocabularyEntry::new("Triglycerides", Lipid, &["Triglyceride", "TG", "TRIG"]),
        VocabularyEntry::new("Apolipoprotein B", Lipid, &["ApoB", "Apo B", "Apo-B"]),
        VocabularyEntry::new("Lipoprotein(a)", Lipid, &["Lp(a)", "Lipoprotein a"]),
        VocabularyEntry::new(
            "Glucose",
            Metabolic,
            &["Fasting Glucose", "Glucose, Fasting", "Blood Glucose", "FBG"],
        ),
        VocabularyEntry::new(
            "Hemoglobin A1c",
            Metabolic,
            &["HbA1c", "A1c", "Hb A1c", "Glycated Hemoglobin", "Glycohemoglobin"],
        ),
        VocabularyEntry::new("Insulin", Metabolic, &["Fasting Insulin"]),
        VocabularyEntry::new("TSH", Thyroid, &["Thyroid Stimulating Hormone", "Thyrotropin"]),
        VocabularyEntry::new("Free T4", Thyroid, &["FT4", "T4, Free", "T4 Free", "Free Thyroxine"]),
        VocabularyEntry::new(
            "Free T3",
            Thyroid,
            &["FT3", "T3, Free", "T3 Free", "Free Triiodothyronine"],
        ),
        VocabularyEntry::new(
            "Vitamin D",
            Vitamin,
            &["25-OH Vitamin D", "25-Hydroxy Vitamin D", "Vitamin D, 25-Hydroxy", "25(OH)D"],
        ),
        VocabularyEntry::new("Vitamin B12", Vitamin, &["B12", "Cobalamin"]),
        VocabularyEntry::new("Folate", Vitamin, &["Folic Acid", "Serum Folate"]),
        VocabularyEntry::new("Ferritin", Mineral, &["Serum Ferritin"]),
        VocabularyEntry::new("Iron", Mineral, &["Serum Iron"]),
        VocabularyEntry::new("Magnesium", Mineral, &[]),
        VocabularyEntry::new("Calcium", Mineral, &[]),
        VocabularyEntry::new("Sodium", Mineral, &[]),
        VocabularyEntry::new("Potassium", Mineral, &[]),
        VocabularyEntry::new("Zinc", Mineral, &[]),
        VocabularyEntry::new("Hemoglobin", Blood, &["Hgb", "Hb", "Haemoglobin"]),
        VocabularyEntry::new("Hematocrit", Blood, &["Hct", "Haematocrit"]),
        VocabularyEntry::new(
            "White Blood Cells",
            Blood,
            &["WBC", "White Blood Cell Count", "Leukocytes"],
        ),
        VocabularyEntry::new(
            "Red Blood Cells",
            Blood,
            &["RBC", "Red Blood Cell Count", "Erythrocytes"],
        ),
        VocabularyEntry::new("Platelets", Blood, &["Platelet Count", "PLT"]),
        VocabularyEntry::new("MCV", Blood, &["Mean Corpuscular Volume"]),
        VocabularyEntry::new("ALT", Liver, &["SGPT", "Alanine Aminotransferase", "ALT (SGPT)"]),
        VocabularyEntry::new("AST", Liver, &["SGOT", "Aspartate Aminotransferase", "AST (SGOT)"]),
        VocabularyEntry::new("Alkaline Phosphatase", Liver, &["ALP", "Alk Phos"]),
        VocabularyEntry::new("GGT", Liver, &["Gamma-Glutamyl Transferase", "Gamma GT"]),
        VocabularyEntry::new(
            "Total Bilirubin",
            Liver,
            &["Bilirubin", "Bilirubin, Total", "Bilirubin Total"],
        ),
        VocabularyEntry::new("Albumin", Liver, &["Serum Albumin"]),
        VocabularyEntry::new("Creatinine", Kidney, &["Serum Creatinine", "Creat"]),
        VocabularyEntry::new("BUN", Kidney, &["Blood Urea Nitrogen", "Urea Nitrogen"]),
        VocabularyEntry::new("eGFR", Kidney, &["GFR", "Estimated GFR"]),
        VocabularyEntry::new("Uric Acid", Kidney, &["Urate"]),
        VocabularyEntry::new(
            "Testosterone",
            Hormone,
            &["Total Testosterone", "Testosterone, Total"],
        ),
        VocabularyEntry::new("Estradiol", Hormone, &["Oestradiol"]),
        VocabularyEntry::new("Cortisol", Hormone, &["AM Cortisol"]),
        VocabularyEntry::new("DHEA-S", Hormone, &["DHEA Sulfate", "DHEAS"]),
        VocabularyEntry::new(
            "C-Reactive Protein",
            Other,
            &["CRP", "hs-CRP", "hsCRP", "High Sensitivity CRP"],
        ),
        VocabularyEntry::new("Homocysteine", Other, &[]),
    ]
});

static BUILTIN_VOCABULARY: LazyLock<Vocabulary> = LazyLock::new(|| {
    Vocabulary::new(BUILTIN.clone()).unwrap_or_else(|e| {
        tracing::error!(error = %e, "built-in vocabulary failed to compile");
        Vocabulary {
            entries: Vec::new(),
            by_spelling: HashMap::new(),
            pattern: None,
        }
    })
});

fn lookup_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn alias_pattern(alias: &str) -> String {
    let body = alias
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let starts_word = alias.chars().next().is_some_and(char::is_alphanumeric);
    let ends_word = alias.chars().last().is_some_and(char::is_alphanumeric);
    format!(
        "{}{}{}",
        if starts_word { r"\b" } else { "" },
        body,
        if ends_word { r"\b" } else { "" }
    )
}

/// A vocabulary hit inside a line, as byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameMatch<'a> {
    pub entry: &'a VocabularyEntry,
    pub start: usize,
    pub end: usize,
}

/// Canonicalization table for biomarker names.
///
/// The built-in table covers common panels; deployments can layer their own
/// entries on top with [`Vocabulary::merged_with`] or [`Vocabulary::load`].
#[derive(Debug, Clone)]
pub struct Vocabulary {
    entries: Vec<VocabularyEntry>,
    by_spelling: HashMap<String, usize>,
    pattern: Option<Regex>,
}

impl Vocabulary {
    pub fn new(entries: Vec<VocabularyEntry>) -> Result<Self> {
        let mut by_spelling = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.canonical.trim().is_empty() {
                return Err(Error::InvalidVocabulary("entry with empty canonical name".into()));
            }
            for spelling in entry.spellings() {
                let key = lookup_key(spelling);
                if !key.is_empty() {
                    by_spelling.insert(key, index);
                }
            }
        }

        let mut spellings: Vec<&str> = entries
            .iter()
            .flat_map(VocabularyEntry::spellings)
            .filter(|s| !s.trim().is_empty())
            .collect();
        // Longest first so the alternation prefers "HDL Cholesterol" over "HDL".
        spellings.sort_by_key(|s| std::cmp::Reverse(s.len()));
        spellings.dedup();

        let pattern = if spellings.is_empty() {
            None
        } else {
            let alternation = spellings
                .iter()
                .map(|s| alias_pattern(s))
                .collect::<Vec<_>>()
                .join("|");
            let regex = Regex::new(&format!("(?i)(?:{alternation})"))
                .map_err(|e| Error::InvalidVocabulary(e.to_string()))?;
            Some(regex)
        };

        Ok(Self {
            entries,
            by_spelling,
            pattern,
        })
    }

    #[must_use]
    pub fn builtin() -> Self {
        BUILTIN_VOCABULARY.clone()
    }

    /// Parses a JSON array of `{canonical, category, aliases}` objects.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<VocabularyEntry> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    /// Layers `extra` over this vocabulary. Entries sharing a canonical name
    /// (case-insensitive) are replaced; the rest are appended.
    pub fn merged_with(self, extra: Vec<VocabularyEntry>) -> Result<Self> {
        let mut entries = self.entries;
        for entry in extra {
            let key = lookup_key(&entry.canonical);
            match entries.iter_mut().find(|e| lookup_key(&e.canonical) == key) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        Self::new(entries)
    }

    /// Built-in table merged with the entries in a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let extra: Vec<VocabularyEntry> = serde_json::from_str(&json)?;
        Self::builtin().merged_with(extra)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VocabularyEntry] {
        &self.entries
    }

    /// Exact (case- and spacing-insensitive) lookup of a known spelling.
    #[must_use]
    pub fn canonicalize(&self, name: &str) -> Option<&VocabularyEntry> {
        self.by_spelling
            .get(&lookup_key(name))
            .map(|&index| &self.entries[index])
    }

    /// Leftmost known biomarker name in `line`.
    #[must_use]
    pub fn find_in<'a>(&'a self, line: &str) -> Option<NameMatch<'a>> {
        let pattern = self.pattern.as_ref()?;
        let found = pattern.find(line)?;
        let entry = self.canonicalize(found.as_str())?;
        Some(NameMatch {
            entry,
            start: found.start(),
            end: found.end(),
        })
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_compiles() {
        let vocabulary = Vocabulary::builtin();
        assert!(vocabulary.len() > 40);
        assert!(vocabulary.pattern.is_some());
    }

    #[test]
    fn test_hdl_synonyms_canonicalize() {
        let vocabulary = Vocabulary::builtin();
        for spelling in ["HDL", "HDL-C", "hdl cholesterol", "HDL   Cholesterol"] {
            let entry = vocabulary.canonicalize(spelling).unwrap();
            assert_eq!(entry.canonical, "HDL Cholesterol");
            assert_eq!(entry.category, BiomarkerCategory::Lipid);
        }
        assert!(vocabulary.canonicalize("Unobtainium").is_none());
    }

    #[test]
    fn test_find_prefers_longest_spelling() {
        let vocabulary = Vocabulary::builtin();

        let hit = vocabulary.find_in("HDL Cholesterol 55 mg/dL").unwrap();
        assert_eq!(hit.entry.canonical, "HDL Cholesterol");
        assert_eq!(hit.end, "HDL Cholesterol".len());

        let hit = vocabulary.find_in("Non-HDL Cholesterol 130 mg/dL").unwrap();
        assert_eq!(hit.entry.canonical, "Non-HDL Cholesterol");

        let hit = vocabulary.find_in("HbA1c 5.4 %").unwrap();
        assert_eq!(hit.entry.canonical, "Hemoglobin A1c");

        let hit = vocabulary.find_in("Lp(a) 30 nmol/L").unwrap();
        assert_eq!(hit.entry.canonical, "Lipoprotein(a)");
    }

    #[test]
    fn test_word_boundaries() {
        let vocabulary = Vocabulary::builtin();
        assert!(vocabulary.find_in("Dr. Halter reviewed").is_none());
    }

    #[test]
    fn test_merge_overrides_and_appends() {
        let json = r#"[
            {"canonical": "Glucose", "category": "metabolic", "aliases": ["GLU", "Sugar"]},
            {"canonical": "Omega-3 Index", "category": "other", "aliases": ["Omega 3 Index"]}
        ]"#;
        let extra: Vec<VocabularyEntry> = serde_json::from_str(json).unwrap();
        let vocabulary = Vocabulary::builtin().merged_with(extra).unwrap();

        assert_eq!(vocabulary.canonicalize("glu").unwrap().canonical, "Glucose");
        assert!(vocabulary.canonicalize("FBG").is_none());
        assert_eq!(
            vocabulary.canonicalize("omega 3 index").unwrap().category,
            BiomarkerCategory::Other
        );
    }

    #[test]
    fn test_rejects_empty_canonical() {
        let result = Vocabulary::from_json(r#"[{"canonical": " ", "category": "other"}]"#);
        assert!(matches!(result, Err(Error::InvalidVocabulary(_))));
    }

    #[test]
    fn test_rejects_unknown_category() {
        let result = Vocabulary::from_json(r#"[{"canonical": "X", "category": "cardiac"}]"#);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
