//! Page-level layout repair that has to run before whitespace is collapsed:
//! multi-column reflow and repeated header/footer removal.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::preprocessor::PreprocessConfig;

static PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:page\s*)?\d{1,4}(?:\s*(?:of|/)\s*\d{1,4})?$").unwrap()
});
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Character column range where the right-hand column starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnSplit {
    start: usize,
    end: usize,
}

/// An internal run of spaces: `(gap_start, resume)` as char indices.
fn internal_gaps(chars: &[char], min_gap: usize) -> Vec<(usize, usize)> {
    let first = match chars.iter().position(|c| *c != ' ') {
        Some(i) => i,
        None => return Vec::new(),
    };
    let mut gaps = Vec::new();
    let mut i = first;
    while i < chars.len() {
        if chars[i] == ' ' {
            let start = i;
            while i < chars.len() && chars[i] == ' ' {
                i += 1;
            }
            if i < chars.len() && i - start >= min_gap {
                gaps.push((start, i));
            }
        } else {
            i += 1;
        }
    }
    gaps
}

fn expand_tabs(line: &str) -> Vec<char> {
    line.chars()
        .flat_map(|c| {
            if c == '\t' {
                vec![' '; 4]
            } else {
                vec![c]
            }
        })
        .collect()
}

fn leading_spaces(chars: &[char]) -> usize {
    chars.iter().take_while(|c| **c == ' ').count()
}

/// Looks for a second column by clustering where text resumes after a wide gap.
/// Table rows (several gaps, or a short value cell) do not count as evidence.
fn detect_columns(lines: &[Vec<char>], config: &PreprocessConfig) -> Option<ColumnSplit> {
    let non_empty = lines.iter().filter(|l| l.iter().any(|c| *c != ' ')).count();
    if non_empty < config.min_column_lines {
        return None;
    }

    let mut offsets: Vec<usize> = lines
        .iter()
        .filter_map(|chars| {
            let gaps = internal_gaps(chars, config.column_gap_min);
            let [(gap_start, resume)] = gaps.as_slice() else {
                return None;
            };
            let left = chars[..*gap_start].iter().filter(|c| **c != ' ').count();
            let right = chars[*resume..].iter().filter(|c| **c != ' ').count();
            (left >= config.min_column_chars && right >= config.min_column_chars).then_some(*resume)
        })
        .collect();

    if offsets.len() < config.min_column_lines {
        return None;
    }
    offsets.sort_unstable();

    let window = config.column_offset_tolerance * 2;
    let mut best = (0, 0, 0);
    for (i, &lo) in offsets.iter().enumerate() {
        let members = offsets[i..].iter().take_while(|&&o| o - lo <= window).count();
        if members > best.0 {
            best = (members, lo, offsets[i + members - 1]);
        }
    }

    let (members, start, end) = best;
    let enough_lines = members >= config.min_column_lines;
    let enough_share = members as f64 / non_empty as f64 >= config.column_line_ratio;
    (enough_lines && enough_share).then_some(ColumnSplit { start, end })
}

fn reflow_lines(lines: &[Vec<char>], split: ColumnSplit, tolerance: usize) -> Vec<String> {
    let mut left = Vec::new();
    let mut right = Vec::new();

    for chars in lines {
        if chars.iter().all(|c| *c == ' ') {
            left.push(String::new());
            right.push(String::new());
            continue;
        }

        let gap = internal_gaps(chars, 2)
            .into_iter()
            .find(|(_, resume)| *resume >= split.start && *resume <= split.end);

        if let Some((gap_start, resume)) = gap {
            left.push(chars[..gap_start].iter().collect::<String>().trim_end().to_string());
            right.push(chars[resume..].iter().collect::<String>());
        } else if leading_spaces(chars) + tolerance >= split.start {
            right.push(chars.iter().collect::<String>().trim_start().to_string());
        } else {
            left.push(chars.iter().collect());
        }
    }

    left.extend(right);
    left
}

/// Rewrites a page to read column by column. Returns `None` when the page is
/// single-column.
pub(crate) fn reflow_page(page: &str, config: &PreprocessConfig) -> Option<String> {
    let lines: Vec<Vec<char>> = page.lines().map(expand_tabs).collect();
    let split = detect_columns(&lines, config)?;
    Some(reflow_lines(&lines, split, config.column_offset_tolerance).join("\n"))
}

fn is_page_number(line: &str) -> bool {
    PAGE_NUMBER.is_match(line)
}

/// Page numbers always match each other. Any other pair must carry the same
/// digits, so repeated analytes with different results stay apart.
fn near_identical(a: &str, b: &str, threshold: f64) -> bool {
    if is_page_number(a) && is_page_number(b) {
        return true;
    }
    if !DIGITS.find_iter(a).map(|m| m.as_str()).eq(DIGITS.find_iter(b).map(|m| m.as_str())) {
        return false;
    }
    strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase()) >= threshold
}

/// Indices (into `page`) of the first or last `count` non-empty lines,
/// nearest the edge first.
fn edge_lines(page: &[String], count: usize, from_top: bool) -> Vec<usize> {
    let non_empty: Vec<usize> = page
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, _)| i)
        .collect();
    if from_top {
        non_empty.into_iter().take(count).collect()
    } else {
        non_empty.into_iter().rev().take(count).collect()
    }
}

/// Marks lines that repeat at the same edge position on enough pages.
/// Lines for which `is_measurement` holds are never marked.
fn mark_repeated(
    pages: &[Vec<String>],
    config: &PreprocessConfig,
    from_top: bool,
    is_measurement: &dyn Fn(&str) -> bool,
    removed: &mut [BTreeSet<usize>],
) -> bool {
    let required =
        ((pages.len() as f64 * config.header_footer_min_page_ratio).ceil() as usize).max(2);
    let candidates: Vec<Vec<usize>> = pages
        .iter()
        .map(|p| edge_lines(p, config.header_footer_scan_lines, from_top))
        .collect();

    let mut found = false;
    for position in 0..config.header_footer_scan_lines {
        for (page_index, page_candidates) in candidates.iter().enumerate() {
            let Some(&line_index) = page_candidates.get(position) else {
                continue;
            };
            let line = pages[page_index][line_index].trim();
            if is_measurement(line) {
                continue;
            }

            let matches = candidates
                .iter()
                .enumerate()
                .filter(|(other_page, other)| {
                    other.get(position).is_some_and(|&other_line| {
                        let other_text = pages[*other_page][other_line].trim();
                        near_identical(line, other_text, config.header_footer_similarity)
                    })
                })
                .count();

            if matches >= required {
                removed[page_index].insert(line_index);
                found = true;
            }
        }
    }
    found
}

pub(crate) struct EdgeStripped {
    pub pages: Vec<Vec<String>>,
    pub has_headers: bool,
    pub has_footers: bool,
}

/// Drops lines repeated near-identically at the top or bottom of multiple pages.
pub(crate) fn strip_headers_footers(
    pages: Vec<Vec<String>>,
    config: &PreprocessConfig,
    is_measurement: &dyn Fn(&str) -> bool,
) -> EdgeStripped {
    if pages.len() < 2 {
        return EdgeStripped {
            pages,
            has_headers: false,
            has_footers: false,
        };
    }

    let mut removed = vec![BTreeSet::new(); pages.len()];
    let has_headers = mark_repeated(&pages, config, true, is_measurement, &mut removed);
    let has_footers = mark_repeated(&pages, config, false, is_measurement, &mut removed);

    let pages = pages
        .into_iter()
        .zip(removed)
        .map(|(lines, drop)| {
            lines
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !drop.contains(i))
                .map(|(_, l)| l)
                .collect()
        })
        .collect();

    EdgeStripped {
        pages,
        has_headers,
        has_footers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PreprocessConfig {
        PreprocessConfig::default()
    }

    fn page(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| (*l).to_string()).collect()
    }

    fn strip(pages: Vec<Vec<String>>) -> EdgeStripped {
        strip_headers_footers(pages, &config(), &|_: &str| false)
    }

    #[test]
    fn test_two_column_page_is_reflowed() {
        let text = [
            "Patient history notes here     Lipid results listed below",
            "second line of the history      HDL Cholesterol 55 mg/dL",
            "third line continues on         LDL Cholesterol 99 mg/dL",
            "fourth line closes it out       Triglycerides 120 mg/dL",
        ]
        .join("\n");

        let reflowed = reflow_page(&text, &config()).expect("two columns");
        let lines: Vec<&str> = reflowed.lines().collect();

        assert_eq!(lines[0], "Patient history notes here");
        assert_eq!(lines[3], "fourth line closes it out");
        assert_eq!(lines[4], "Lipid results listed below");
        assert_eq!(lines[5], "HDL Cholesterol 55 mg/dL");
    }

    #[test]
    fn test_table_rows_are_not_columns() {
        let text = [
            "Test                 Result     Units      Range",
            "HDL Cholesterol      55         mg/dL      40-60",
            "LDL Cholesterol      99         mg/dL      0-100",
            "Triglycerides        120        mg/dL      0-150",
            "Glucose              90         mg/dL      70-99",
        ]
        .join("\n");

        assert!(reflow_page(&text, &config()).is_none());
    }

    #[test]
    fn test_single_column_prose() {
        let text =
            "This is a normal paragraph\nwith a few lines\nof ordinary text\nand nothing else";
        assert!(reflow_page(text, &config()).is_none());
    }

    #[test]
    fn test_repeated_header_and_page_number_footer_removed() {
        let pages = vec![
            page(&["Acme Labs Report - Jane Doe", "HDL Cholesterol 55 mg/dL", "Page 1 of 2"]),
            page(&["Acme Labs Report - Jane Doe", "Glucose 90 mg/dL", "Page 2 of 2"]),
        ];

        let stripped = strip(pages);

        assert!(stripped.has_headers);
        assert!(stripped.has_footers);
        assert_eq!(stripped.pages[0], vec!["HDL Cholesterol 55 mg/dL".to_string()]);
        assert_eq!(stripped.pages[1], vec!["Glucose 90 mg/dL".to_string()]);
    }

    #[test]
    fn test_single_page_keeps_everything() {
        let pages = vec![page(&["Acme Labs", "Glucose 90 mg/dL", "Page 1"])];
        let stripped = strip(pages);
        assert!(!stripped.has_headers);
        assert!(!stripped.has_footers);
        assert_eq!(stripped.pages[0].len(), 3);
    }

    #[test]
    fn test_distinct_page_edges_are_kept() {
        let pages = vec![
            page(&["Lipid Panel", "HDL Cholesterol 55 mg/dL", "Fasting sample"]),
            page(&["Thyroid Panel", "TSH 2.1 mIU/L", "Morning draw"]),
        ];
        let stripped = strip(pages);
        assert!(!stripped.has_headers);
        assert!(!stripped.has_footers);
    }

    #[test]
    fn test_repeated_analytes_with_different_values_kept() {
        let pages = vec![
            page(&["Glucose 90 mg/dL", "HDL Cholesterol 55 mg/dL", "LDL Cholesterol 99 mg/dL"]),
            page(&["Glucose 95 mg/dL", "TSH 2.1 mIU/L", "LDL Cholesterol 98 mg/dL"]),
        ];

        let stripped = strip(pages.clone());

        assert!(!stripped.has_headers);
        assert!(!stripped.has_footers);
        assert_eq!(stripped.pages, pages);
    }

    #[test]
    fn test_identical_measurement_rows_kept() {
        let pages = vec![
            page(&["Acme Labs", "Glucose 90 mg/dL", "Page 1"]),
            page(&["Acme Labs", "Glucose 90 mg/dL", "Page 2"]),
        ];
        let is_measurement = |line: &str| line.starts_with("Glucose");

        let stripped = strip_headers_footers(pages, &config(), &is_measurement);

        assert!(stripped.has_headers);
        assert!(stripped.has_footers);
        assert_eq!(stripped.pages[0], vec!["Glucose 90 mg/dL".to_string()]);
        assert_eq!(stripped.pages[1], vec!["Glucose 90 mg/dL".to_string()]);
    }

    #[test]
    fn test_near_identical_requires_same_digits() {
        assert!(near_identical("Page 1 of 3", "Page 2 of 3", 0.85));
        assert!(near_identical("Acme Labs 2024", "ACME Labs 2024", 0.85));
        assert!(!near_identical("Glucose 90 mg/dL", "Glucose 95 mg/dL", 0.85));
        assert!(!near_identical("Report 2024-03-15", "Report 2024-03-16", 0.85));
    }

    #[test]
    fn test_page_number_pattern() {
        assert!(is_page_number("Page 3 of 10"));
        assert!(is_page_number("4"));
        assert!(is_page_number("2/5"));
        assert!(!is_page_number("Glucose 90"));
    }
}
