use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::dates::detect_document_date;
use super::vocabulary::{NameMatch, Vocabulary};
use crate::biomarker::BiomarkerRecord;

/// Clinical units recognized after a value, in their canonical spelling.
pub const UNITS: &[&str] = &[
    "mg/dL", "mg/L", "g/dL", "g/L", "mmol/L", "µmol/L", "umol/L", "nmol/L", "pmol/L",
    "mIU/L", "mIU/mL", "µIU/mL", "uIU/mL", "IU/L", "IU/mL", "U/L", "IU", "mEq/L",
    "ng/mL", "ng/dL", "pg/mL", "µg/dL", "ug/dL", "mcg/dL", "µg/L", "mcg/L", "fL", "pg",
    "x10^3/µL", "x10^3/uL", "x10^9/L", "x10^6/µL", "x10^12/L", "K/uL", "M/uL",
    "cells/µL", "mL/min/1.73m²", "mL/min/1.73m2", "mm/hr", "sec", "%", "ratio",
];

const NUMBER: &str = r"\d[\d.,]*";

static UNIT_LOOKUP: LazyLock<HashMap<String, &'static str>> =
    LazyLock::new(|| UNITS.iter().map(|u| (u.to_lowercase(), *u)).collect());

fn unit_alternation() -> String {
    let mut units: Vec<&str> = UNITS.to_vec();
    units.sort_by_key(|u| std::cmp::Reverse(u.len()));
    units.iter().map(|u| regex::escape(u)).collect::<Vec<_>>().join("|")
}

static LEADING_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[\s:=]+|\.{2,})*").unwrap());

static VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(?P<cmp>[<>]=?|≤|≥)?\s*(?P<num>{NUMBER})")).unwrap()
});

static FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(?:HH|LL|High|Low|H|L|\([HL]\))(?:\s+|$)|\*+\s*)").unwrap()
});

static UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)^\s*(?P<unit>{})", unit_alternation())).unwrap());

static ANY_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)(?:^|[\s\d])(?:{})(?:$|[\s),;])", unit_alternation())).unwrap()
});

static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*\(?\s*(?:(?:ref(?:erence)?(?:\s+range)?|range|normal)\s*[:=]?\s*)?(?P<range>(?:[<>]=?|≤|≥)\s*{NUMBER}|{NUMBER}\s*(?:-|–|to)\s*{NUMBER})(?:\s*(?P<unit>{}))?\s*\)?",
        unit_alternation()
    ))
    .unwrap()
});

static RANGE_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:-|–|\bto\b)\s*").unwrap());

/// What the extractor found in one document. Parsing problems are data, not
/// failures: they sit next to the records that did parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutput {
    pub biomarkers: Vec<BiomarkerRecord>,
    pub parsing_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_date: Option<NaiveDate>,
}

impl ExtractionOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.biomarkers.is_empty() && self.parsing_errors.is_empty()
    }

    /// Gives every record without a test date the supplied one.
    pub fn fill_missing_dates(&mut self, date: NaiveDate) {
        for record in &mut self.biomarkers {
            if record.test_date.is_none() {
                record.test_date = Some(date);
            }
        }
    }
}

/// Reads a number that may use `,` as thousands or decimal separator.
///
/// A single comma is a decimal point unless exactly three digits follow it;
/// when both separators appear, the rightmost one is the decimal point.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim_end_matches(['.', ',']);
    if raw.is_empty() {
        return None;
    }

    let grouped = |s: &str, sep: char| -> Option<String> {
        let mut groups = s.split(sep);
        let head = groups.next()?;
        if head.is_empty() || head.len() > 3 {
            return None;
        }
        let mut digits = head.to_string();
        for group in groups {
            if group.len() != 3 {
                return None;
            }
            digits.push_str(group);
        }
        Some(digits)
    };

    let commas = raw.matches(',').count();
    let dots = raw.matches('.').count();

    let canonical = match (commas, dots) {
        (0, 0 | 1) => raw.to_string(),
        (0, _) => grouped(raw, '.')?,
        (1, 0) => {
            let (whole, fraction) = raw.split_once(',')?;
            if fraction.len() == 3 {
                format!("{whole}{fraction}")
            } else {
                format!("{whole}.{fraction}")
            }
        }
        (_, 0) => grouped(raw, ',')?,
        _ => {
            let last_comma = raw.rfind(',')?;
            let last_dot = raw.rfind('.')?;
            if last_dot > last_comma {
                let (int, fraction) = raw.split_at(last_dot);
                format!("{}{fraction}", grouped(int, ',')?)
            } else {
                let (int, fraction) = raw.split_at(last_comma);
                format!("{}.{}", grouped(int, '.')?, &fraction[1..])
            }
        }
    };

    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn canonical_unit(raw: &str) -> Option<&'static str> {
    UNIT_LOOKUP.get(&raw.to_lowercase()).copied()
}

/// `unit` ends at a boundary rather than mid-word.
fn ends_cleanly(rest: &str) -> bool {
    rest.chars()
        .next()
        .map_or(true, |c| c.is_whitespace() || matches!(c, ')' | ',' | ';' | '('))
}

enum LineOutcome {
    /// A record, plus a warning when the value was only a bound.
    Record(BiomarkerRecord, Option<String>),
    Error(String),
    /// Name but nothing after it; the value may be on the next line.
    NameOnly,
    Skip,
}

/// Line-oriented biomarker extraction over normalized text.
#[derive(Debug, Clone)]
pub struct BiomarkerExtractor {
    vocabulary: Arc<Vocabulary>,
}

impl BiomarkerExtractor {
    #[must_use]
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self { vocabulary }
    }

    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    #[must_use]
    pub fn extract(&self, normalized_text: &str) -> ExtractionOutput {
        let mut output = ExtractionOutput::new();
        let lines: Vec<&str> = normalized_text.lines().collect();

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            match self.parse_line(line) {
                LineOutcome::Record(record, warning) => {
                    output.biomarkers.push(record);
                    output.parsing_errors.extend(warning);
                }
                LineOutcome::Error(message) => output.parsing_errors.push(message),
                LineOutcome::NameOnly => {
                    if let Some((record, warning)) =
                        self.join_with_next(line, lines.get(i + 1).copied())
                    {
                        output.biomarkers.push(record);
                        output.parsing_errors.extend(warning);
                        i += 1;
                    }
                }
                LineOutcome::Skip => {}
            }
            i += 1;
        }

        output.parsing_errors.extend(unit_mismatches(&output.biomarkers));

        output.document_date = detect_document_date(normalized_text);
        if let Some(date) = output.document_date {
            output.fill_missing_dates(date);
        }

        tracing::debug!(
            biomarkers = output.biomarkers.len(),
            parsing_errors = output.parsing_errors.len(),
            "biomarker extraction finished"
        );
        output
    }

    fn find_name<'a>(&'a self, line: &str) -> Option<NameMatch<'a>> {
        find_name(&self.vocabulary, line)
    }

    fn parse_line(&self, line: &str) -> LineOutcome {
        let Some(name) = self.find_name(line) else {
            return LineOutcome::Skip;
        };
        let rest = strip_separators(&line[name.end..]);
        if rest.is_empty() {
            return LineOutcome::NameOnly;
        }

        match parse_measurement(rest) {
            Some(Ok(measurement)) => {
                let warning = measurement.bound_warning(&name.entry.canonical, line);
                LineOutcome::Record(measurement.into_record(name), warning)
            }
            Some(Err(())) => LineOutcome::Error(format!(
                "Could not parse value for {}: \"{line}\"",
                name.entry.canonical
            )),
            None if looks_like_value(rest) => LineOutcome::Error(format!(
                "Could not parse value for {}: \"{line}\"",
                name.entry.canonical
            )),
            None => LineOutcome::Skip,
        }
    }

    fn join_with_next(
        &self,
        line: &str,
        next: Option<&str>,
    ) -> Option<(BiomarkerRecord, Option<String>)> {
        let next = next?;
        if self.find_name(next).is_some() {
            return None;
        }
        let name = self.find_name(line)?;
        let measurement = parse_measurement(strip_separators(next))?.ok()?;
        let warning = measurement.bound_warning(&name.entry.canonical, next);
        Some((measurement.into_record(name), warning))
    }
}

impl Default for BiomarkerExtractor {
    fn default() -> Self {
        Self::new(Arc::new(Vocabulary::builtin()))
    }
}

/// A name only counts when nothing alphabetic precedes it on the line, so
/// narrative mentions ("Your LDL is 99") are not read as results.
fn find_name<'a>(vocabulary: &'a Vocabulary, line: &str) -> Option<NameMatch<'a>> {
    let found = vocabulary.find_in(line)?;
    let prefix = &line[..found.start];
    (!prefix.chars().any(char::is_alphabetic)).then_some(found)
}

/// The line would parse as a single result row.
pub(crate) fn reads_as_measurement(vocabulary: &Vocabulary, line: &str) -> bool {
    find_name(vocabulary, line).is_some_and(|name| {
        matches!(parse_measurement(strip_separators(&line[name.end..])), Some(Ok(_)))
    })
}

fn strip_separators(rest: &str) -> &str {
    let skip = LEADING_SEPARATORS.find(rest).map_or(0, |m| m.end());
    rest[skip..].trim_end()
}

/// Something in the remainder suggests a value was intended.
fn looks_like_value(rest: &str) -> bool {
    let first_has_digit = rest
        .split_whitespace()
        .next()
        .is_some_and(|t| t.chars().any(|c| c.is_ascii_digit()));
    first_has_digit || ANY_UNIT.is_match(rest)
}

struct Measurement {
    value: f64,
    /// `<`, `>`, `≤` or `≥` printed before the value.
    comparator: Option<String>,
    unit: Option<&'static str>,
    reference_range: Option<String>,
}

impl Measurement {
    /// Records keep only the number, so a bounded value ("<0.5") is reported
    /// next to them.
    fn bound_warning(&self, canonical: &str, line: &str) -> Option<String> {
        self.comparator.as_ref().map(|cmp| {
            format!(
                "Value for {canonical} is a bound ({cmp}{}), stored as {}: \"{line}\"",
                self.value, self.value
            )
        })
    }

    fn into_record(self, name: NameMatch<'_>) -> BiomarkerRecord {
        BiomarkerRecord {
            name: name.entry.canonical.clone(),
            value: self.value,
            unit: self.unit.unwrap_or_default().to_string(),
            reference_range: self.reference_range,
            test_date: None,
            category: Some(name.entry.category),
        }
    }
}

fn skip_flag(rest: &str) -> &str {
    FLAG.find(rest).map_or(rest, |m| &rest[m.end()..])
}

/// `None` when the text does not start with a number at all, `Err` when it
/// does but the number (or what is glued to it) is garbled.
fn parse_measurement(rest: &str) -> Option<Result<Measurement, ()>> {
    let caps = VALUE.captures(rest)?;
    let number = caps.name("num")?;
    let Some(value) = parse_number(number.as_str()) else {
        return Some(Err(()));
    };
    let comparator = caps.name("cmp").map(|m| m.as_str().to_string());
    let mut remaining = &rest[number.end()..];

    // Letters glued to the number must form a unit ("55mg/dL"), not a typo ("5O").
    if remaining.chars().next().is_some_and(char::is_alphabetic) && UNIT.find(remaining).is_none() {
        return Some(Err(()));
    }

    remaining = skip_flag(remaining);

    let mut unit = None;
    if let Some(found) = UNIT.captures(remaining) {
        if let Some(m) = found.name("unit") {
            if ends_cleanly(&remaining[m.end()..]) {
                unit = canonical_unit(m.as_str());
                remaining = &remaining[m.end()..];
            }
        }
    }

    remaining = skip_flag(remaining);

    let reference_range = RANGE.captures(remaining).and_then(|found| {
        let range = found.name("range")?;
        let mut text = RANGE_DASH.replace_all(range.as_str().trim(), "-").into_owned();
        text = text.replace(' ', "");
        if let Some(range_unit) = found.name("unit").and_then(|u| canonical_unit(u.as_str())) {
            text = format!("{text} {range_unit}");
        }
        Some(text)
    });

    Some(Ok(Measurement {
        value,
        comparator,
        unit,
        reference_range,
    }))
}

/// One error per canonical name reported with more than one distinct unit.
fn unit_mismatches(records: &[BiomarkerRecord]) -> Vec<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut units: HashMap<&str, Vec<&str>> = HashMap::new();
    for record in records {
        if record.unit.is_empty() {
            continue;
        }
        let seen = units.entry(record.name.as_str()).or_insert_with(|| {
            order.push(record.name.as_str());
            Vec::new()
        });
        if !seen.contains(&record.unit.as_str()) {
            seen.push(record.unit.as_str());
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let found = units.get(name)?;
            (found.len() > 1)
                .then(|| format!("Unit mismatch for {name}: found {}", found.join(", ")))
        })
        .collect()
}
