use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiomarkerCategory {
    Lipid,
    Metabolic,
    Thyroid,
    Vitamin,
    Mineral,
    Blood,
    Liver,
    Kidney,
    Hormone,
    Other,
}

impl BiomarkerCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lipid => "lipid",
            Self::Metabolic => "metabolic",
            Self::Thyroid => "thyroid",
            Self::Vitamin => "vitamin",
            Self::Mineral => "mineral",
            Self::Blood => "blood",
            Self::Liver => "liver",
            Self::Kidney => "kidney",
            Self::Hormone => "hormone",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for BiomarkerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BiomarkerCategory {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lipid" => Ok(Self::Lipid),
            "metabolic" => Ok(Self::Metabolic),
            "thyroid" => Ok(Self::Thyroid),
            "vitamin" => Ok(Self::Vitamin),
            "mineral" => Ok(Self::Mineral),
            "blood" => Ok(Self::Blood),
            "liver" => Ok(Self::Liver),
            "kidney" => Ok(Self::Kidney),
            "hormone" => Ok(Self::Hormone),
            "other" => Ok(Self::Other),
            _ => Err(crate::Error::InvalidCategory(s.to_string())),
        }
    }
}

/// One parsed lab measurement. `value` is always finite; lines that fail
/// numeric parsing never become a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiomarkerRecord {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<BiomarkerCategory>,
}

impl BiomarkerRecord {
    /// Returns `None` when `value` is NaN or infinite.
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Some(Self {
            name: name.into(),
            value,
            unit: String::new(),
            reference_range: None,
            test_date: None,
            category: None,
        })
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    #[must_use]
    pub fn with_reference_range(mut self, range: impl Into<String>) -> Self {
        self.reference_range = Some(range.into());
        self
    }

    #[must_use]
    pub fn with_test_date(mut self, date: NaiveDate) -> Self {
        self.test_date = Some(date);
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: BiomarkerCategory) -> Self {
        self.category = Some(category);
        self
    }
}
