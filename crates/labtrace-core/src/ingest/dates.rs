//! Finds the collection/report date printed on a lab report.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

const DATE: &str = r"(?P<date>\d{4}-\d{1,2}-\d{1,2}|\d{1,2}/\d{1,2}/\d{2,4}|\d{1,2}\.\d{1,2}\.\d{4}|[A-Za-z]{3,9}\.?\s+\d{1,2},?\s+\d{4}|\d{1,2}\s+[A-Za-z]{3,9}\.?,?\s+\d{4})";

static COLLECTION_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:collect(?:ed|ion)(?:\s+date)?|date\s+(?:collected|drawn)|specimen\s+date|sample\s+date|draw\s+date|drawn)\s*(?:on)?\s*[:\-]?\s*{DATE}"
    ))
    .unwrap()
});

static ANY_LABELED_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:report(?:ed)?\s+date|date\s+(?:reported|of\s+service)|test\s+date|received|date)\s*(?:on)?\s*[:\-]?\s*{DATE}"
    ))
    .unwrap()
});

/// Words that turn a bare "Date" label into something other than the test date.
const NON_TEST_DATE_WORDS: &[&str] = &["birth", "dob", "expiry", "expiration", "print", "printed"];

/// The word right before `at` on the same line names a birth (or similar) date.
fn follows_excluded_word(text: &str, at: usize) -> bool {
    let line_start = text[..at].rfind('\n').map_or(0, |i| i + 1);
    text[line_start..at]
        .split(|c: char| !c.is_alphanumeric())
        .rfind(|w| !w.is_empty())
        .is_some_and(|word| NON_TEST_DATE_WORDS.contains(&word.to_lowercase().as_str()))
}

fn two_digit_year(year: i32) -> i32 {
    match year {
        0..=69 => 2000 + year,
        70..=99 => 1900 + year,
        _ => year,
    }
}

/// Parses one date token. Slash dates are read month-first unless the first
/// number cannot be a month.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }

    if raw.contains('/') {
        let parts: Vec<i32> = raw.split('/').map(str::parse).collect::<Result<_, _>>().ok()?;
        let [a, b, year] = parts.as_slice() else {
            return None;
        };
        let year = two_digit_year(*year);
        let (month, day) = if *a > 12 { (*b, *a) } else { (*a, *b) };
        return NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?);
    }

    if raw.contains('.') && raw.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%d.%m.%Y") {
            return Some(date);
        }
    }

    let cleaned = raw.replace([',', '.'], " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%b %d %Y", "%d %b %Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&cleaned, format).ok())
}

/// Collection dates win over any other labeled date; the first parseable
/// match of each kind is used. Birth dates never count.
#[must_use]
pub fn detect_document_date(text: &str) -> Option<NaiveDate> {
    [&*COLLECTION_DATE, &*ANY_LABELED_DATE].iter().find_map(|pattern| {
        pattern
            .captures_iter(text)
            .filter(|caps| caps.get(0).is_some_and(|m| !follows_excluded_word(text, m.start())))
            .filter_map(|caps| caps.name("date"))
            .find_map(|m| parse_date(m.as_str()))
    })
}
