use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ocr::{OcrEngine, OcrError};

/// Separates pages in [`RawExtraction::text`].
pub const PAGE_BREAK: char = '\x0c';

pub const PDF_MIME: &str = "application/pdf";
pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const PLAIN_TEXT_MIME: &str = "text/plain";
pub const IMAGE_MIMES: &[&str] = &["image/png", "image/jpeg", "image/jpg"];

/// Unreadable or corrupt upload. The cause is for logs only.
#[derive(Debug, Error)]
#[error("could not read {mime_type} document: {cause}")]
pub struct FormatExtractionError {
    pub mime_type: String,
    pub cause: String,
}

impl FormatExtractionError {
    pub fn new(mime_type: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            mime_type: mime_type.into(),
            cause: cause.to_string(),
        }
    }

    pub fn user_message(&self) -> String {
        format!(
            "We could not read this file ({}). Please upload an unprotected, undamaged copy.",
            self.mime_type
        )
    }
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Format(#[from] FormatExtractionError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error("Unsupported mime type: {0}")]
    UnsupportedFormat(String),
}

pub type ReadResult<T> = Result<T, ReaderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Image,
    PlainText,
}

impl DocumentFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            PDF_MIME => Some(Self::Pdf),
            DOCX_MIME => Some(Self::Docx),
            PLAIN_TEXT_MIME => Some(Self::PlainText),
            m if IMAGE_MIMES.contains(&m) => Some(Self::Image),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Image => "image",
            Self::PlainText => "plain_text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrInfo {
    pub engine: String,
    pub confidence: f32,
}

/// Text pulled out of an upload before any cleanup, plus document stats.
#[derive(Debug, Clone)]
pub struct RawExtraction {
    pub format: DocumentFormat,
    /// Pages joined with [`PAGE_BREAK`].
    pub text: String,
    pub page_count: Option<u32>,
    pub paragraph_count: Option<u32>,
    /// 1-based page numbers whose text layer fell below the density threshold.
    pub likely_scanned_pages: Vec<u32>,
    pub ocr: Option<OcrInfo>,
}

impl RawExtraction {
    #[must_use]
    pub fn new(format: DocumentFormat, text: String) -> Self {
        Self {
            format,
            text,
            page_count: None,
            paragraph_count: None,
            likely_scanned_pages: Vec::new(),
            ocr: None,
        }
    }

    #[must_use]
    pub fn with_page_count(mut self, count: u32) -> Self {
        self.page_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_paragraph_count(mut self, count: u32) -> Self {
        self.paragraph_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_ocr(mut self, engine: String, confidence: f32) -> Self {
        self.ocr = Some(OcrInfo { engine, confidence });
        self
    }
}

#[async_trait::async_trait]
pub trait FormatReader: Send + Sync {
    fn supported_mime_types(&self) -> &[&'static str];

    async fn extract_raw_text(&self, data: &[u8], mime_type: &str) -> ReadResult<RawExtraction>;
}

pub struct PlainTextReader;

#[async_trait::async_trait]
impl FormatReader for PlainTextReader {
    fn supported_mime_types(&self) -> &[&'static str] {
        &[PLAIN_TEXT_MIME]
    }

    async fn extract_raw_text(&self, data: &[u8], mime_type: &str) -> ReadResult<RawExtraction> {
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| FormatExtractionError::new(mime_type, e))?;
        let pages = text.split(PAGE_BREAK).count() as u32;

        Ok(RawExtraction::new(DocumentFormat::PlainText, text).with_page_count(pages))
    }
}

pub struct PdfReader {
    scanned_page_min_chars: usize,
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl PdfReader {
    #[must_use]
    pub fn new(scanned_page_min_chars: usize) -> Self {
        Self {
            scanned_page_min_chars,
            ocr: None,
        }
    }

    #[must_use]
    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    fn scanned_pages(&self, pages: &[String]) -> Vec<u32> {
        pages
            .iter()
            .enumerate()
            .filter(|(_, page)| {
                page.chars().filter(|c| !c.is_whitespace()).count() < self.scanned_page_min_chars
            })
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }
}

#[async_trait::async_trait]
impl FormatReader for PdfReader {
    fn supported_mime_types(&self) -> &[&'static str] {
        &[PDF_MIME]
    }

    async fn extract_raw_text(&self, data: &[u8], mime_type: &str) -> ReadResult<RawExtraction> {
        let bytes = data.to_vec();
        // pdf-extract is synchronous and panics on some malformed inputs; the
        // blocking task turns a panic into a JoinError.
        let pages = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem_by_pages(&bytes)
        })
        .await
        .map_err(|e| FormatExtractionError::new(mime_type, e))?
        .map_err(|e| FormatExtractionError::new(mime_type, e))?;

        let page_count = pages.len() as u32;
        let scanned = self.scanned_pages(&pages);

        if !pages.is_empty() && scanned.len() == pages.len() {
            if let Some(ocr) = &self.ocr {
                match ocr.recognize(data, mime_type).await {
                    Ok(output) => {
                        tracing::debug!(engine = %output.engine, "PDF has no text layer, used OCR");
                        return Ok(RawExtraction::new(DocumentFormat::Pdf, output.text)
                            .with_page_count(page_count)
                            .with_ocr(output.engine, output.confidence));
                    }
                    Err(OcrError::UnsupportedInput(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            tracing::warn!(
                pages = page_count,
                "PDF appears to be scanned, no OCR fallback available"
            );
        }

        let text = pages.join(&PAGE_BREAK.to_string());
        let mut raw = RawExtraction::new(DocumentFormat::Pdf, text).with_page_count(page_count);
        raw.likely_scanned_pages = scanned;
        Ok(raw)
    }
}

pub struct DocxReader;

#[async_trait::async_trait]
impl FormatReader for DocxReader {
    fn supported_mime_types(&self) -> &[&'static str] {
        &[DOCX_MIME]
    }

    async fn extract_raw_text(&self, data: &[u8], mime_type: &str) -> ReadResult<RawExtraction> {
        let bytes = data.to_vec();
        let json = tokio::task::spawn_blocking(move || {
            docx_rs::read_docx(&bytes).map(|docx| docx.json())
        })
        .await
        .map_err(|e| FormatExtractionError::new(mime_type, e))?
        .map_err(|e| FormatExtractionError::new(mime_type, e))?;

        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| FormatExtractionError::new(mime_type, e))?;

        let lines = docx_lines(&value);
        let paragraphs = lines.len() as u32;

        Ok(RawExtraction::new(DocumentFormat::Docx, lines.join("\n"))
            .with_paragraph_count(paragraphs))
    }
}

/// Walks the docx JSON tree in document order. Paragraphs become one line each;
/// table rows become one line with cells separated by two spaces.
fn docx_lines(value: &serde_json::Value) -> Vec<String> {
    let mut lines = Vec::new();
    let body = value
        .get("document")
        .and_then(|d| d.get("children"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    collect_blocks(&body, &mut lines);
    lines
}

fn collect_blocks(value: &serde_json::Value, lines: &mut Vec<String>) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_blocks(item, lines);
            }
        }
        serde_json::Value::Object(map) => match map.get("type").and_then(|t| t.as_str()) {
            Some("paragraph") => {
                let mut line = String::new();
                collect_text(value, &mut line);
                lines.push(line);
            }
            Some("tableRow") => {
                let cells = map
                    .get("data")
                    .and_then(|d| d.get("cells"))
                    .and_then(|c| c.as_array())
                    .map(|cells| {
                        cells
                            .iter()
                            .map(|cell| {
                                let mut text = String::new();
                                collect_text(cell, &mut text);
                                text.trim().to_string()
                            })
                            .filter(|t| !t.is_empty())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                lines.push(cells.join("  "));
            }
            _ => {
                for child in map.values() {
                    collect_blocks(child, lines);
                }
            }
        },
        _ => {}
    }
}

fn collect_text(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            if map.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(text) = map
                    .get("data")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                {
                    out.push_str(text);
                }
                return;
            }
            if map.get("type").and_then(|t| t.as_str()) == Some("tab") {
                out.push(' ');
                return;
            }
            for child in map.values() {
                collect_text(child, out);
            }
        }
        _ => {}
    }
}

pub struct ImageReader {
    ocr: Arc<dyn OcrEngine>,
}

impl ImageReader {
    #[must_use]
    pub fn new(ocr: Arc<dyn OcrEngine>) -> Self {
        Self { ocr }
    }
}

#[async_trait::async_trait]
impl FormatReader for ImageReader {
    fn supported_mime_types(&self) -> &[&'static str] {
        IMAGE_MIMES
    }

    async fn extract_raw_text(&self, data: &[u8], mime_type: &str) -> ReadResult<RawExtraction> {
        let output = self.ocr.recognize(data, mime_type).await.map_err(|e| match e {
            OcrError::Failed(cause) | OcrError::UnsupportedInput(cause) => {
                ReaderError::Format(FormatExtractionError::new(mime_type, cause))
            }
            other => ReaderError::Ocr(other),
        })?;

        Ok(RawExtraction::new(DocumentFormat::Image, output.text)
            .with_page_count(1)
            .with_ocr(output.engine, output.confidence))
    }
}

/// Mime type to reader lookup. Adding a format means registering one more
/// reader; the orchestrator never branches on format.
pub struct ReaderRegistry {
    readers: Vec<Arc<dyn FormatReader>>,
    by_mime: HashMap<&'static str, usize>,
}

impl ReaderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
            by_mime: HashMap::new(),
        }
    }

    /// PDF, DOCX and plain text; images only when an OCR engine is given.
    #[must_use]
    pub fn with_defaults(scanned_page_min_chars: usize, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        let mut pdf = PdfReader::new(scanned_page_min_chars);
        if let Some(engine) = &ocr {
            pdf = pdf.with_ocr(Arc::clone(engine));
        }

        let mut registry = Self::new()
            .with_reader(Arc::new(pdf))
            .with_reader(Arc::new(DocxReader))
            .with_reader(Arc::new(PlainTextReader));
        if let Some(engine) = ocr {
            registry = registry.with_reader(Arc::new(ImageReader::new(engine)));
        }
        registry
    }

    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn FormatReader>) -> Self {
        self.add_reader(reader);
        self
    }

    pub fn add_reader(&mut self, reader: Arc<dyn FormatReader>) {
        let index = self.readers.len();
        for &mime in reader.supported_mime_types() {
            self.by_mime.insert(mime, index);
        }
        self.readers.push(reader);
    }

    pub fn supports(&self, mime_type: &str) -> bool {
        self.by_mime.contains_key(mime_type)
    }

    pub fn reader_for(&self, mime_type: &str) -> Option<&dyn FormatReader> {
        self.by_mime
            .get(mime_type)
            .map(|&index| self.readers[index].as_ref())
    }

    pub async fn extract(&self, data: &[u8], mime_type: &str) -> ReadResult<RawExtraction> {
        let reader = self
            .reader_for(mime_type)
            .ok_or_else(|| ReaderError::UnsupportedFormat(mime_type.to_string()))?;

        reader.extract_raw_text(data, mime_type).await
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::with_defaults(50, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ocr::{OcrOutput, OcrResult};
    use crate::ingest::preprocessor::{Preprocessor, ProcessingStep};

    struct FixedOcr;

    #[async_trait::async_trait]
    impl OcrEngine for FixedOcr {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn recognize(&self, _data: &[u8], mime_type: &str) -> OcrResult<OcrOutput> {
            if mime_type == PDF_MIME {
                return Err(OcrError::UnsupportedInput(mime_type.into()));
            }
            Ok(OcrOutput {
                text: "Glucose 90 mg/dL".into(),
                confidence: 0.82,
                engine: "fixed".into(),
            })
        }
    }

    struct BrokenOcr;

    #[async_trait::async_trait]
    impl OcrEngine for BrokenOcr {
        fn name(&self) -> &str {
            "broken"
        }

        async fn recognize(&self, _data: &[u8], _mime_type: &str) -> OcrResult<OcrOutput> {
            Err(OcrError::Failed("not an image".into()))
        }
    }

    #[test]
    fn test_format_from_mime() {
        assert_eq!(DocumentFormat::from_mime(PDF_MIME), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_mime(DOCX_MIME), Some(DocumentFormat::Docx));
        assert_eq!(DocumentFormat::from_mime("image/jpeg"), Some(DocumentFormat::Image));
        assert_eq!(DocumentFormat::from_mime("application/zip"), None);
    }

    #[tokio::test]
    async fn test_plain_text_reader_counts_pages() {
        let raw = PlainTextReader
            .extract_raw_text(b"page one\x0cpage two", PLAIN_TEXT_MIME)
            .await
            .unwrap();
        assert_eq!(raw.page_count, Some(2));
        assert_eq!(raw.format, DocumentFormat::PlainText);
    }

    #[tokio::test]
    async fn test_plain_text_reader_rejects_invalid_utf8() {
        let err = PlainTextReader
            .extract_raw_text(&[0xff, 0xfe, 0x00], PLAIN_TEXT_MIME)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Format(_)));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_format_error() {
        let err = PdfReader::new(50)
            .extract_raw_text(b"definitely not a pdf", PDF_MIME)
            .await
            .unwrap_err();
        match err {
            ReaderError::Format(e) => {
                assert_eq!(e.mime_type, PDF_MIME);
                assert!(!e.user_message().contains(&e.cause));
            }
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_docx_is_format_error() {
        let err = DocxReader
            .extract_raw_text(b"PK\x03\x04garbage", DOCX_MIME)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Format(_)));
    }

    #[tokio::test]
    async fn test_image_reader_records_ocr_engine() {
        let reader = ImageReader::new(Arc::new(FixedOcr));
        let raw = reader.extract_raw_text(b"\x89PNG", "image/png").await.unwrap();
        let ocr = raw.ocr.unwrap();
        assert_eq!(ocr.engine, "fixed");
        assert!((ocr.confidence - 0.82).abs() < f32::EPSILON);
        assert_eq!(raw.text, "Glucose 90 mg/dL");
    }

    #[tokio::test]
    async fn test_unreadable_image_is_format_error() {
        let reader = ImageReader::new(Arc::new(BrokenOcr));
        let err = reader.extract_raw_text(b"junk", "image/png").await.unwrap_err();
        assert!(matches!(err, ReaderError::Format(_)));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ReaderRegistry::with_defaults(50, None);
        assert!(registry.supports(PDF_MIME));
        assert!(registry.supports(DOCX_MIME));
        assert!(!registry.supports("image/png"));

        let with_ocr = ReaderRegistry::with_defaults(50, Some(Arc::new(FixedOcr)));
        assert!(with_ocr.supports("image/png"));
        assert!(with_ocr.supports("image/jpeg"));
    }

    #[test]
    fn test_scanned_page_detection() {
        let reader = PdfReader::new(10);
        let pages = vec![
            "Lipid Panel HDL Cholesterol 55 mg/dL".to_string(),
            "   \n ".to_string(),
            "p. 3".to_string(),
        ];
        assert_eq!(reader.scanned_pages(&pages), vec![2, 3]);
    }

    fn docx_bytes() -> Vec<u8> {
        use docx_rs::{Docx, Paragraph, Run, Table, TableCell, TableRow};

        let paragraph = |text: &str| Paragraph::new().add_run(Run::new().add_text(text));
        let cell = |text: &str| TableCell::new().add_paragraph(paragraph(text));

        let mut buf = std::io::Cursor::new(Vec::new());
        Docx::new()
            .add_paragraph(paragraph("Lipid Panel"))
            .add_table(Table::new(vec![
                TableRow::new(vec![cell("HDL Cholesterol"), cell("55 mg/dL")]),
                TableRow::new(vec![cell("Glucose"), cell("90 mg/dL")]),
            ]))
            .build()
            .pack(&mut buf)
            .unwrap();
        buf.into_inner()
    }

    /// A text PDF with one content stream per page, one `Tj` per line.
    fn pdf_bytes(pages: &[&[&str]]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for lines in pages {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
            ];
            for (i, line) in lines.iter().enumerate() {
                if i > 0 {
                    operations.push(Operation::new("Td", vec![0.into(), (-20).into()]));
                }
                operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            }
            operations.push(Operation::new("ET", vec![]));

            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = i64::try_from(kids.len()).unwrap();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_docx_document_reads_paragraphs_and_rows() {
        let raw = DocxReader.extract_raw_text(&docx_bytes(), DOCX_MIME).await.unwrap();

        assert_eq!(raw.format, DocumentFormat::Docx);
        assert_eq!(raw.text, "Lipid Panel\nHDL Cholesterol  55 mg/dL\nGlucose  90 mg/dL");
        assert_eq!(raw.paragraph_count, Some(3));

        let text = Preprocessor::default().preprocess_extraction(&raw);
        assert_eq!(
            text.normalized_text(),
            "Lipid Panel\nHDL Cholesterol 55 mg/dL\nGlucose 90 mg/dL"
        );
        assert_eq!(
            text.metadata().processing_steps,
            vec![ProcessingStep::Normalization, ProcessingStep::QualityScoring]
        );
        assert_eq!(text.metadata().original_format, DocumentFormat::Docx);
    }

    #[tokio::test]
    async fn test_pdf_document_reads_every_page() {
        let bytes = pdf_bytes(&[
            &["Acme Labs", "HDL Cholesterol 55 mg/dL"],
            &["Acme Labs", "Glucose 90 mg/dL"],
        ]);

        let raw = PdfReader::new(10).extract_raw_text(&bytes, PDF_MIME).await.unwrap();

        assert_eq!(raw.format, DocumentFormat::Pdf);
        assert_eq!(raw.page_count, Some(2));
        assert!(raw.likely_scanned_pages.is_empty());
        assert_eq!(raw.text.matches(PAGE_BREAK).count(), 1);

        let text = Preprocessor::default().preprocess_extraction(&raw);
        let normalized = text.normalized_text();
        assert!(normalized.contains("HDL Cholesterol 55 mg/dL"));
        assert!(normalized.contains("Glucose 90 mg/dL"));
        assert!(!normalized.contains("Acme Labs"));
        assert!(text.metadata().has_headers);
        assert!(text.metadata().processing_steps.contains(&ProcessingStep::HeaderFooterRemoval));
    }

    #[test]
    fn test_docx_lines_from_json_tree() {
        let json = serde_json::json!({
            "document": {
                "children": [
                    {"type": "paragraph", "data": {"children": [
                        {"type": "run", "data": {"children": [
                            {"type": "text", "data": {"text": "Lipid "}},
                            {"type": "text", "data": {"text": "Panel"}}
                        ]}}
                    ]}},
                    {"type": "table", "data": {"rows": [
                        {"type": "tableRow", "data": {"cells": [
                            {"type": "tableCell", "data": {"children": [
                                {"type": "paragraph", "data": {"children": [
                                    {"type": "run", "data": {"children": [
                                        {"type": "text", "data": {"text": "HDL"}}
                                    ]}}
                                ]}}
                            ]}},
                            {"type": "tableCell", "data": {"children": [
                                {"type": "paragraph", "data": {"children": [
                                    {"type": "run", "data": {"children": [
                                        {"type": "text", "data": {"text": "55 mg/dL"}}
                                    ]}}
                                ]}}
                            ]}}
                        ]}}
                    ]}}
                ]
            }
        });

        assert_eq!(docx_lines(&json), vec!["Lipid Panel", "HDL  55 mg/dL"]);
    }
}
