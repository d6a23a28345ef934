use std::fmt::Write as _;

use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::biomarker::BiomarkerRecord;
use crate::config::CompletionConfig;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion service not configured")]
    NotConfigured,
    #[error("Invalid completion URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Completion API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Completion response had no content")]
    EmptyResponse,
}

pub type CompletionResult<T> = Result<T, CompletionError>;

/// Narrative summary of one report. Callers treat every failure as
/// non-fatal.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        normalized_text: &str,
        biomarkers: &[BiomarkerRecord],
    ) -> CompletionResult<String>;
}

const SYSTEM_PROMPT: &str = "You summarize laboratory reports for the patient who owns them. \
Be brief and factual, mention values outside their reference ranges, and do not give a diagnosis.";

fn build_prompt(normalized_text: &str, biomarkers: &[BiomarkerRecord], max_chars: usize) -> String {
    let mut prompt = String::from("Extracted results:\n");
    if biomarkers.is_empty() {
        prompt.push_str("(none recognized)\n");
    }
    for b in biomarkers {
        let _ = write!(prompt, "- {}: {} {}", b.name, b.value, b.unit);
        if let Some(range) = &b.reference_range {
            let _ = write!(prompt, " (reference {range})");
        }
        prompt.push('\n');
    }

    let excerpt: String = normalized_text.chars().take(max_chars).collect();
    let _ = write!(prompt, "\nReport text:\n{excerpt}");
    prompt
}

/// Calls an OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiSummarizer {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_input_chars: usize,
}

impl OpenAiSummarizer {
    pub fn new(config: &CompletionConfig) -> CompletionResult<Self> {
        let api_key = config.api_key.clone().ok_or(CompletionError::NotConfigured)?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)?.join("chat/completions")?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key,
            model: config.model.clone(),
            max_input_chars: config.max_input_chars,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(
        &self,
        normalized_text: &str,
        biomarkers: &[BiomarkerRecord],
    ) -> CompletionResult<String> {
        let prompt = build_prompt(normalized_text, biomarkers, self.max_input_chars);

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt}
                ],
                "temperature": 0.2
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(CompletionError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let result = OpenAiSummarizer::new(&CompletionConfig::default());
        assert!(matches!(result, Err(CompletionError::NotConfigured)));
    }

    #[test]
    fn test_endpoint_join() {
        let config = CompletionConfig {
            api_key: Some("sk-test".into()),
            base_url: "http://localhost:8080/v1".into(),
            ..CompletionConfig::default()
        };
        let summarizer = OpenAiSummarizer::new(&config).unwrap();
        assert_eq!(summarizer.endpoint().as_str(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_prompt_truncates_text() {
        let record = BiomarkerRecord::new("Glucose", 90.0)
            .unwrap()
            .with_unit("mg/dL")
            .with_reference_range("70-99");
        let prompt = build_prompt(&"x".repeat(100), &[record], 10);

        assert!(prompt.contains("- Glucose: 90 mg/dL (reference 70-99)"));
        assert!(prompt.ends_with(&"x".repeat(10)));
        assert!(!prompt.contains(&"x".repeat(11)));
    }
}
