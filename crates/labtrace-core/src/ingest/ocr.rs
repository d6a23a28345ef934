use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine not installed: {0}")]
    NotInstalled(String),
    #[error("OCR engine cannot read {0} input")]
    UnsupportedInput(String),
    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
    #[error("OCR failed: {0}")]
    Failed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcrError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }
}

pub type OcrResult<T> = Result<T, OcrError>;

#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Mean recognition confidence in `[0, 1]`.
    pub confidence: f32,
    pub engine: String,
}

/// Black-box text recognition over an image (or scanned document) buffer.
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, data: &[u8], mime_type: &str) -> OcrResult<OcrOutput>;
}

/// Runs the `tesseract` CLI, feeding the image on stdin and reading TSV from
/// stdout so word confidences are available.
pub struct TesseractOcr {
    binary: PathBuf,
    language: String,
    timeout: Duration,
}

impl TesseractOcr {
    pub const ENGINE_NAME: &'static str = "tesseract";

    #[must_use]
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            language: "eng".to_string(),
            timeout,
        }
    }

    /// Locates `tesseract` on `PATH`.
    pub fn detect(timeout: Duration) -> Option<Self> {
        which::which("tesseract")
            .ok()
            .map(|binary| Self::new(binary, timeout))
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    fn accepts(mime_type: &str) -> bool {
        matches!(
            mime_type,
            "image/png" | "image/jpeg" | "image/jpg" | "image/tiff" | "image/bmp"
        )
    }
}

#[async_trait::async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        Self::ENGINE_NAME
    }

    async fn recognize(&self, data: &[u8], mime_type: &str) -> OcrResult<OcrOutput> {
        if !Self::accepts(mime_type) {
            return Err(OcrError::UnsupportedInput(mime_type.to_string()));
        }
        if !self.binary.exists() {
            return Err(OcrError::NotInstalled(self.binary.display().to_string()));
        }

        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Failed("stdin not captured".into()))?;
        let input = data.to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OcrError::Timeout(self.timeout))??;

        if let Ok(Err(e)) = writer.await {
            tracing::debug!(error = %e, "tesseract closed stdin early");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Failed(stderr.trim().to_string()));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let (text, confidence) = parse_tsv(&tsv);

        Ok(OcrOutput {
            text,
            confidence,
            engine: Self::ENGINE_NAME.to_string(),
        })
    }
}

/// Rebuilds line-broken text from tesseract TSV rows and averages the word
/// confidences.
fn parse_tsv(tsv: &str) -> (String, f32) {
    let mut text = String::new();
    let mut current_line: Option<(u32, u32, u32)> = None;
    let mut current_block: Option<u32> = None;
    let mut confidence_sum = 0.0_f32;
    let mut word_count = 0_u32;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let block: u32 = cols[2].parse().unwrap_or(0);
        let par: u32 = cols[3].parse().unwrap_or(0);
        let line: u32 = cols[4].parse().unwrap_or(0);
        let key = (block, par, line);

        if current_line != Some(key) {
            if current_line.is_some() {
                text.push('\n');
                if current_block != Some(block) {
                    text.push('\n');
                }
            }
            current_line = Some(key);
            current_block = Some(block);
        } else {
            text.push(' ');
        }
        text.push_str(word);

        if let Ok(conf) = cols[10].parse::<f32>() {
            if conf >= 0.0 {
                confidence_sum += conf;
                word_count += 1;
            }
        }
    }

    let confidence = if word_count == 0 {
        0.0
    } else {
        (confidence_sum / word_count as f32 / 100.0).clamp(0.0, 1.0)
    };

    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t\n\
5\t1\t1\t1\t1\t1\t10\t10\t40\t12\t96.5\tHDL\n\
5\t1\t1\t1\t1\t2\t55\t10\t80\t12\t91.5\tCholesterol\n\
5\t1\t1\t1\t2\t1\t10\t30\t20\t12\t88.0\t55\n\
5\t1\t2\t1\t1\t1\t10\t80\t60\t12\t84.0\tGlucose\n";

    #[test]
    fn test_parse_tsv_rebuilds_lines() {
        let (text, confidence) = parse_tsv(SAMPLE_TSV);
        assert_eq!(text, "HDL Cholesterol\n55\n\nGlucose");
        assert!((confidence - 0.9).abs() < 0.001);
    }

    #[test]
    fn test_parse_tsv_empty() {
        let (text, confidence) = parse_tsv("level\tpage_num\n");
        assert!(text.is_empty());
        assert!(confidence.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_rejects_pdf_input() {
        let ocr =
            TesseractOcr::new(PathBuf::from("/nonexistent/tesseract"), Duration::from_secs(1));
        let err = ocr.recognize(b"%PDF-1.4", "application/pdf").await.unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedInput(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_transient() {
        let ocr =
            TesseractOcr::new(PathBuf::from("/nonexistent/tesseract"), Duration::from_secs(1));
        let err = ocr.recognize(b"\x89PNG", "image/png").await.unwrap_err();
        assert!(matches!(err, OcrError::NotInstalled(_)));
        assert!(!err.is_transient());
    }
}
