use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::extractor::reads_as_measurement;
use super::layout;
use super::reader::{DocumentFormat, OcrInfo, RawExtraction, PAGE_BREAK};
use super::vocabulary::Vocabulary;
use crate::{Error, Result};

static DIGIT_LETTER_CONFUSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+[lIOoS]\d*|[lIOoS]\d+)$").unwrap());
static DIGIT_INSIDE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{2,}[01][A-Za-z]{2,}$").unwrap());

/// Tunables for the text preprocessor.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Minimum run of spaces that separates two columns.
    pub column_gap_min: usize,
    /// Both sides of a column split need at least this many non-space chars.
    pub min_column_chars: usize,
    pub min_column_lines: usize,
    /// Share of non-empty lines that must agree on the split position.
    pub column_line_ratio: f64,
    pub column_offset_tolerance: usize,
    pub header_footer_scan_lines: usize,
    pub header_footer_similarity: f64,
    pub header_footer_min_page_ratio: f64,
    /// Suspicious tokens per 1000 characters above which text is treated as
    /// noisy OCR output.
    pub ocr_noise_per_thousand: f64,
    pub special_char_ratio_limit: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            column_gap_min: 3,
            min_column_chars: 12,
            min_column_lines: 4,
            column_line_ratio: 0.5,
            column_offset_tolerance: 2,
            header_footer_scan_lines: 2,
            header_footer_similarity: 0.85,
            header_footer_min_page_ratio: 0.5,
            ocr_noise_per_thousand: 5.0,
            special_char_ratio_limit: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    ColumnReflow,
    HeaderFooterRemoval,
    Normalization,
    QualityScoring,
}

impl ProcessingStep {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ColumnReflow => "column_reflow",
            Self::HeaderFooterRemoval => "header_footer_removal",
            Self::Normalization => "normalization",
            Self::QualityScoring => "quality_scoring",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceScore {
    High,
    Medium,
    Low,
}

impl ConfidenceScore {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    fn downgrade(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub whitespace_ratio: f64,
    pub special_char_ratio: f64,
    pub numeric_ratio: f64,
    pub potential_ocr_errors: u32,
}

impl QualityMetrics {
    fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("whitespaceRatio", self.whitespace_ratio),
            ("specialCharRatio", self.special_char_ratio),
            ("numericRatio", self.numeric_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::InvalidPreprocessedText(format!(
                    "{name} {ratio} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    pub original_format: DocumentFormat,
    pub processing_steps: Vec<ProcessingStep>,
    pub confidence_score: ConfidenceScore,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
    pub processing_timestamp: DateTime<Utc>,
    pub text_length: usize,
    pub line_count: usize,
    pub has_headers: bool,
    pub has_footers: bool,
    pub quality_metrics: QualityMetrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub likely_scanned_pages: Vec<u32>,
}

/// Raw and normalized text of one upload plus how it was produced.
///
/// Only constructible through [`PreprocessedText::new`] (or deserialization,
/// which routes through the same checks), so a stored value always carries a
/// timestamp, at least one processing step, ratios within `[0, 1]`, and length
/// counters that agree with the normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "PreprocessedTextDraft")]
pub struct PreprocessedText {
    raw_text: String,
    normalized_text: String,
    processing_metadata: ProcessingMetadata,
}

impl PreprocessedText {
    pub fn new(
        raw_text: String,
        normalized_text: String,
        processing_metadata: ProcessingMetadata,
    ) -> Result<Self> {
        let text = Self {
            raw_text,
            normalized_text,
            processing_metadata,
        };
        text.validate()?;
        Ok(text)
    }

    fn validate(&self) -> Result<()> {
        let meta = &self.processing_metadata;
        if meta.processing_steps.is_empty() {
            return Err(Error::InvalidPreprocessedText(
                "processingSteps is empty".into(),
            ));
        }
        let length = self.normalized_text.chars().count();
        if meta.text_length != length {
            return Err(Error::InvalidPreprocessedText(format!(
                "textLength {} does not match normalized text length {length}",
                meta.text_length
            )));
        }
        let lines = self.normalized_text.lines().count();
        if meta.line_count != lines {
            return Err(Error::InvalidPreprocessedText(format!(
                "lineCount {} does not match normalized line count {lines}",
                meta.line_count
            )));
        }
        if let Some(confidence) = meta.ocr_confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(Error::InvalidPreprocessedText(format!(
                    "ocrConfidence {confidence} outside [0, 1]"
                )));
            }
        }
        meta.quality_metrics.validate()
    }

    #[must_use]
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    #[must_use]
    pub fn normalized_text(&self) -> &str {
        &self.normalized_text
    }

    #[must_use]
    pub fn metadata(&self) -> &ProcessingMetadata {
        &self.processing_metadata
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessingMetadataDraft {
    original_format: Option<DocumentFormat>,
    processing_steps: Option<Vec<ProcessingStep>>,
    confidence_score: Option<ConfidenceScore>,
    ocr_engine: Option<String>,
    ocr_confidence: Option<f32>,
    processing_timestamp: Option<DateTime<Utc>>,
    text_length: Option<usize>,
    line_count: Option<usize>,
    has_headers: Option<bool>,
    has_footers: Option<bool>,
    quality_metrics: Option<QualityMetrics>,
    #[serde(default)]
    likely_scanned_pages: Vec<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreprocessedTextDraft {
    raw_text: Option<String>,
    normalized_text: Option<String>,
    processing_metadata: Option<ProcessingMetadataDraft>,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::InvalidPreprocessedText(format!("missing {field}")))
}

impl TryFrom<PreprocessedTextDraft> for PreprocessedText {
    type Error = Error;

    fn try_from(draft: PreprocessedTextDraft) -> Result<Self> {
        let meta = required(draft.processing_metadata, "processingMetadata")?;
        let metadata = ProcessingMetadata {
            original_format: required(
                meta.original_format,
                "processingMetadata.originalFormat",
            )?,
            processing_steps: required(
                meta.processing_steps,
                "processingMetadata.processingSteps",
            )?,
            confidence_score: required(
                meta.confidence_score,
                "processingMetadata.confidenceScore",
            )?,
            ocr_engine: meta.ocr_engine,
            ocr_confidence: meta.ocr_confidence,
            processing_timestamp: required(
                meta.processing_timestamp,
                "processingMetadata.processingTimestamp",
            )?,
            text_length: required(meta.text_length, "processingMetadata.textLength")?,
            line_count: required(meta.line_count, "processingMetadata.lineCount")?,
            has_headers: required(meta.has_headers, "processingMetadata.hasHeaders")?,
            has_footers: required(meta.has_footers, "processingMetadata.hasFooters")?,
            quality_metrics: required(meta.quality_metrics, "processingMetadata.qualityMetrics")?,
            likely_scanned_pages: meta.likely_scanned_pages,
        };
        Self::new(
            required(draft.raw_text, "rawText")?,
            required(draft.normalized_text, "normalizedText")?,
            metadata,
        )
    }
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}')
}

/// Line endings to `\n`, non-printables dropped, horizontal whitespace
/// collapsed, lines trimmed, blank-line runs collapsed. Idempotent.
pub(crate) fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let cleaned: String = unified
        .chars()
        .filter_map(|c| {
            if c == '\n' {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else if c.is_control() || is_invisible(c) {
                None
            } else {
                Some(c)
            }
        })
        .collect();

    let mut lines: Vec<String> = Vec::new();
    for line in cleaned.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() && lines.last().map_or(true, String::is_empty) {
            continue;
        }
        lines.push(collapsed);
    }
    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines.join("\n")
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_alphanumeric())
}

fn is_alphabetic_word(token: &str) -> bool {
    !token.is_empty() && token.chars().all(char::is_alphabetic)
}

/// Tokens that look like recognition mistakes: digit/letter confusions
/// (`l` for `1`, `O` for `0`), digits embedded in words, and stray single
/// letters between words.
pub(crate) fn count_suspicious_tokens(text: &str) -> u32 {
    let mut count = 0_u32;
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().map(trim_token).collect();
        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                continue;
            }
            if DIGIT_LETTER_CONFUSION.is_match(token) || DIGIT_INSIDE_WORD.is_match(token) {
                count += 1;
                continue;
            }
            let single_letter = token.chars().count() == 1
                && token.chars().all(char::is_alphabetic)
                && !matches!(*token, "a" | "A" | "I");
            if single_letter
                && i > 0
                && i + 1 < tokens.len()
                && is_alphabetic_word(tokens[i - 1])
                && is_alphabetic_word(tokens[i + 1])
            {
                count += 1;
            }
        }
    }
    count
}

fn score_quality(text: &str) -> QualityMetrics {
    let total = text.chars().count();
    if total == 0 {
        return QualityMetrics::default();
    }

    let (mut whitespace, mut special, mut numeric) = (0_usize, 0_usize, 0_usize);
    for c in text.chars() {
        if c.is_whitespace() {
            whitespace += 1;
        } else if c.is_ascii_digit() {
            numeric += 1;
        } else if !c.is_alphanumeric() {
            special += 1;
        }
    }

    let total = total as f64;
    QualityMetrics {
        whitespace_ratio: whitespace as f64 / total,
        special_char_ratio: special as f64 / total,
        numeric_ratio: numeric as f64 / total,
        potential_ocr_errors: count_suspicious_tokens(text),
    }
}

fn confidence_for(
    text: &str,
    metrics: &QualityMetrics,
    ocr: Option<&OcrInfo>,
    config: &PreprocessConfig,
) -> ConfidenceScore {
    if text.is_empty() {
        return ConfidenceScore::Low;
    }

    let mut score = match ocr {
        Some(info) if info.confidence >= 0.85 => ConfidenceScore::High,
        Some(info) if info.confidence >= 0.6 => ConfidenceScore::Medium,
        Some(_) => ConfidenceScore::Low,
        None => ConfidenceScore::High,
    };

    let per_thousand =
        f64::from(metrics.potential_ocr_errors) * 1000.0 / text.chars().count() as f64;
    if per_thousand > config.ocr_noise_per_thousand {
        score = score.downgrade();
    }
    if metrics.special_char_ratio > config.special_char_ratio_limit {
        score = score.downgrade();
    }
    score
}

/// Deterministic text cleanup between the format readers and the extractor.
///
/// The vocabulary keeps result rows from being mistaken for repeated page
/// headers or footers.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
    vocabulary: Arc<Vocabulary>,
}

impl Preprocessor {
    #[must_use]
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config,
            vocabulary: Arc::new(Vocabulary::builtin()),
        }
    }

    #[must_use]
    pub fn with_vocabulary(mut self, vocabulary: Arc<Vocabulary>) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    #[must_use]
    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    #[must_use]
    pub fn preprocess(&self, raw_text: &str, format: DocumentFormat) -> PreprocessedText {
        self.run(raw_text, format, None, Vec::new())
    }

    /// Like [`Self::preprocess`], also carrying OCR details and scanned-page
    /// hints from the reader.
    #[must_use]
    pub fn preprocess_extraction(&self, raw: &RawExtraction) -> PreprocessedText {
        self.run(
            &raw.text,
            raw.format,
            raw.ocr.as_ref(),
            raw.likely_scanned_pages.clone(),
        )
    }

    fn run(
        &self,
        raw_text: &str,
        format: DocumentFormat,
        ocr: Option<&OcrInfo>,
        likely_scanned_pages: Vec<u32>,
    ) -> PreprocessedText {
        let mut steps = Vec::new();

        let mut pages: Vec<String> = raw_text.split(PAGE_BREAK).map(str::to_string).collect();

        if format == DocumentFormat::Pdf {
            let mut reflowed_any = false;
            for page in &mut pages {
                if let Some(reflowed) = layout::reflow_page(page, &self.config) {
                    *page = reflowed;
                    reflowed_any = true;
                }
            }
            if reflowed_any {
                steps.push(ProcessingStep::ColumnReflow);
            }
        }

        let page_lines: Vec<Vec<String>> = pages
            .iter()
            .map(|p| p.lines().map(str::to_string).collect())
            .collect();
        let is_measurement = |line: &str| reads_as_measurement(&self.vocabulary, line);
        let stripped = layout::strip_headers_footers(page_lines, &self.config, &is_measurement);
        if stripped.has_headers || stripped.has_footers {
            steps.push(ProcessingStep::HeaderFooterRemoval);
        }

        let body = stripped
            .pages
            .iter()
            .map(|lines| lines.join("\n"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let normalized_text = normalize(&body);
        steps.push(ProcessingStep::Normalization);

        let quality_metrics = score_quality(&normalized_text);
        steps.push(ProcessingStep::QualityScoring);

        let confidence_score =
            confidence_for(&normalized_text, &quality_metrics, ocr, &self.config);

        let processing_metadata = ProcessingMetadata {
            original_format: format,
            processing_steps: steps,
            confidence_score,
            ocr_engine: ocr.map(|o| o.engine.clone()),
            ocr_confidence: ocr.map(|o| o.confidence.clamp(0.0, 1.0)),
            processing_timestamp: Utc::now(),
            text_length: normalized_text.chars().count(),
            line_count: normalized_text.lines().count(),
            has_headers: stripped.has_headers,
            has_footers: stripped.has_footers,
            quality_metrics,
            likely_scanned_pages,
        };

        let text = PreprocessedText {
            raw_text: raw_text.to_string(),
            normalized_text,
            processing_metadata,
        };
        debug_assert!(text.validate().is_ok());
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace_and_controls() {
        let raw = "  HDL\u{200B} Cholesterol \t 55\x07 mg/dL  \r\n\r\n\r\n\nGlucose   90\r";
        assert_eq!(normalize(raw), "HDL Cholesterol 55 mg/dL\n\nGlucose 90");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = "\n\n  a  b \n\n\n c\u{00A0}d \n\n";
        let once = normalize(raw);
        assert_eq!(normalize(&once), once);
        assert_eq!(once, "a b\n\nc d");
    }

    #[test]
    fn test_empty_input_gives_valid_zeroed_result() {
        let text = Preprocessor::default().preprocess("   \n\t\n", DocumentFormat::Pdf);

        assert_eq!(text.normalized_text(), "");
        let meta = text.metadata();
        assert_eq!(meta.quality_metrics, QualityMetrics::default());
        assert_eq!(meta.text_length, 0);
        assert_eq!(meta.line_count, 0);
        assert_eq!(meta.confidence_score, ConfidenceScore::Low);
        assert_eq!(
            meta.processing_steps,
            vec![ProcessingStep::Normalization, ProcessingStep::QualityScoring]
        );
    }

    #[test]
    fn test_result_rows_at_page_edges_survive() {
        let raw = "Glucose 90 mg/dL\nHDL Cholesterol 55 mg/dL\nLDL Cholesterol 99 mg/dL\x0c\
                   Glucose 95 mg/dL\nTSH 2.1 mIU/L\nLDL Cholesterol 98 mg/dL";

        let text = Preprocessor::default().preprocess(raw, DocumentFormat::Pdf);

        assert_eq!(
            text.normalized_text(),
            "Glucose 90 mg/dL\nHDL Cholesterol 55 mg/dL\nLDL Cholesterol 99 mg/dL\n\n\
             Glucose 95 mg/dL\nTSH 2.1 mIU/L\nLDL Cholesterol 98 mg/dL"
        );
        assert!(!text.metadata().has_headers);
        assert!(!text.metadata().has_footers);
        assert!(!text.metadata().processing_steps.contains(&ProcessingStep::HeaderFooterRemoval));
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let raw = "Acme Labs\nGlucose 90 mg/dL\nPage 1\x0cAcme Labs\nHDL 55 mg/dL\nPage 2";
        let preprocessor = Preprocessor::default();
        let first = preprocessor.preprocess(raw, DocumentFormat::Pdf);
        let second = preprocessor.preprocess(raw, DocumentFormat::Pdf);

        assert_eq!(first.normalized_text(), second.normalized_text());
        assert_eq!(first.metadata().quality_metrics, second.metadata().quality_metrics);
        assert_eq!(first.normalized_text(), "Glucose 90 mg/dL\n\nHDL 55 mg/dL");
        assert!(first.metadata().has_headers);
        assert!(first.metadata().has_footers);
        assert_eq!(
            first.metadata().processing_steps,
            vec![
                ProcessingStep::HeaderFooterRemoval,
                ProcessingStep::Normalization,
                ProcessingStep::QualityScoring
            ]
        );
    }

    #[test]
    fn test_column_reflow_only_for_pdf() {
        let raw = [
            "Patient history notes here     Lipid results listed below",
            "second line of the history      HDL Cholesterol 55 mg/dL",
            "third line continues on         LDL Cholesterol 99 mg/dL",
            "fourth line closes it out       Triglycerides 120 mg/dL",
        ]
        .join("\n");
        let preprocessor = Preprocessor::default();

        let pdf = preprocessor.preprocess(&raw, DocumentFormat::Pdf);
        assert_eq!(pdf.metadata().processing_steps[0], ProcessingStep::ColumnReflow);
        assert!(pdf
            .normalized_text()
            .contains("fourth line closes it out\nLipid results listed below"));

        let docx = preprocessor.preprocess(&raw, DocumentFormat::Docx);
        assert!(!docx.metadata().processing_steps.contains(&ProcessingStep::ColumnReflow));
    }

    #[test]
    fn test_quality_ratios_in_range() {
        let text =
            Preprocessor::default().preprocess("HDL: 55 mg/dL (40-60)", DocumentFormat::PlainText);
        let metrics = text.metadata().quality_metrics;
        for ratio in [metrics.whitespace_ratio, metrics.special_char_ratio, metrics.numeric_ratio] {
            assert!((0.0..=1.0).contains(&ratio));
        }
        assert!(metrics.numeric_ratio > 0.0);
        assert_eq!(metrics.potential_ocr_errors, 0);
    }

    #[test]
    fn test_suspicious_tokens() {
        assert_eq!(count_suspicious_tokens("Cho1esterol l00 mg"), 2);
        assert_eq!(count_suspicious_tokens("the q uick fox"), 1);
        assert_eq!(count_suspicious_tokens("HbA1c 5.4 % Vitamin D 30"), 0);
        assert_eq!(count_suspicious_tokens("I am a patient"), 0);
    }

    #[test]
    fn test_ocr_confidence_drives_score() {
        let raw = RawExtraction::new(DocumentFormat::Image, "Glucose 90 mg/dL".into())
            .with_ocr("tesseract".into(), 0.7);
        let text = Preprocessor::default().preprocess_extraction(&raw);
        assert_eq!(text.metadata().confidence_score, ConfidenceScore::Medium);
        assert_eq!(text.metadata().ocr_engine.as_deref(), Some("tesseract"));
    }

    #[test]
    fn test_deserialize_rejects_missing_timestamp() {
        let text = Preprocessor::default().preprocess("Glucose 90", DocumentFormat::PlainText);
        let mut json = serde_json::to_value(&text).unwrap();
        json["processingMetadata"]
            .as_object_mut()
            .unwrap()
            .remove("processingTimestamp");

        let err = serde_json::from_value::<PreprocessedText>(json).unwrap_err();
        assert!(err.to_string().contains("processingTimestamp"));
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_length() {
        let text = Preprocessor::default().preprocess("Glucose 90", DocumentFormat::PlainText);
        let mut json = serde_json::to_value(&text).unwrap();
        json["processingMetadata"]["textLength"] = serde_json::json!(3);
        assert!(serde_json::from_value::<PreprocessedText>(json).is_err());
    }

    #[test]
    fn test_serialized_round_trip_keeps_shape() {
        let text =
            Preprocessor::default().preprocess("Glucose 90 mg/dL", DocumentFormat::PlainText);
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["processingMetadata"]["originalFormat"], "plain_text");
        assert_eq!(json["processingMetadata"]["confidenceScore"], "high");
        let back: PreprocessedText = serde_json::from_value(json).unwrap();
        assert_eq!(back, text);
    }
}
