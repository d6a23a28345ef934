use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::{DOCX_MIME, IMAGE_MIMES, PDF_MIME, PLAIN_TEXT_MIME};

pub use crate::ingest::PreprocessConfig;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Knobs for the upload orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub allowed_mime_types: Vec<String>,
    pub max_upload_bytes: u64,
    /// Retries after the first attempt before an upload is marked failed.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub ocr_timeout: Duration,
    pub summary_timeout: Duration,
    pub storage_timeout: Duration,
    /// A PDF page with fewer non-whitespace characters than this is treated
    /// as a scan.
    pub scanned_page_min_chars: usize,
    /// Uploads allowed per user within `upload_quota_period`. `None` is unlimited.
    pub upload_quota: Option<u64>,
    pub upload_quota_period: Duration,
    pub vocabulary_path: Option<PathBuf>,
    pub preprocess: PreprocessConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut allowed: Vec<String> =
            vec![PDF_MIME.into(), DOCX_MIME.into(), PLAIN_TEXT_MIME.into()];
        allowed.extend(IMAGE_MIMES.iter().map(|m| (*m).to_string()));

        Self {
            allowed_mime_types: allowed,
            max_upload_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            ocr_timeout: Duration::from_secs(30),
            summary_timeout: Duration::from_secs(15),
            storage_timeout: Duration::from_secs(10),
            scanned_page_min_chars: 50,
            upload_quota: None,
            upload_quota_period: Duration::from_secs(30 * 24 * 60 * 60),
            vocabulary_path: None,
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let allowed_mime_types = std::env::var("LABTRACE_ALLOWED_MIME_TYPES")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|m| m.trim().to_lowercase())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.allowed_mime_types);

        Self {
            allowed_mime_types,
            max_upload_bytes: env_parse("LABTRACE_MAX_UPLOAD_BYTES")
                .unwrap_or(defaults.max_upload_bytes),
            max_retries: env_parse("LABTRACE_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay: env_parse("LABTRACE_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_parse("LABTRACE_RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            ocr_timeout: env_parse("LABTRACE_OCR_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ocr_timeout),
            summary_timeout: env_parse("LABTRACE_SUMMARY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.summary_timeout),
            storage_timeout: env_parse("LABTRACE_STORAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.storage_timeout),
            scanned_page_min_chars: env_parse("LABTRACE_SCANNED_PAGE_MIN_CHARS")
                .unwrap_or(defaults.scanned_page_min_chars),
            upload_quota: env_parse("LABTRACE_UPLOAD_QUOTA"),
            upload_quota_period: env_parse::<u64>("LABTRACE_UPLOAD_QUOTA_DAYS")
                .map(days)
                .unwrap_or(defaults.upload_quota_period),
            vocabulary_path: std::env::var("LABTRACE_VOCABULARY_PATH").ok().map(PathBuf::from),
            preprocess: defaults.preprocess,
        }
    }

    #[must_use]
    pub fn allows_mime_type(&self, mime_type: &str) -> bool {
        let mime_type = mime_type.to_lowercase();
        self.allowed_mime_types.iter().any(|m| *m == mime_type)
    }
}

/// Settings for the OpenAI-compatible summarization endpoint.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Normalized text beyond this many characters is cut before sending.
    pub max_input_chars: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1/".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_input_chars: 12_000,
        }
    }
}

impl CompletionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            base_url: std::env::var("LABTRACE_COMPLETION_URL").unwrap_or(defaults.base_url),
            model: std::env::var("LABTRACE_COMPLETION_MODEL").unwrap_or(defaults.model),
            max_input_chars: defaults.max_input_chars,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Saturates instead of overflowing on absurd day counts.
fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(SECS_PER_DAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list() {
        let config = PipelineConfig::default();
        assert!(config.allows_mime_type("application/pdf"));
        assert!(config.allows_mime_type("IMAGE/PNG"));
        assert!(config.allows_mime_type(DOCX_MIME));
        assert!(!config.allows_mime_type("application/zip"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_quota_days_saturate() {
        assert_eq!(days(30), Duration::from_secs(30 * 86_400));
        assert_eq!(days(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_completion_disabled_without_key() {
        assert!(!CompletionConfig::default().is_enabled());
    }
}
