use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::biomarker::BiomarkerRecord;
use crate::ingest::{ExtractionOutput, PreprocessedText};
use crate::progress::UploadStatus;

/// Row data known when an upload is accepted, before any stage has run.
#[derive(Debug, Clone)]
pub struct NewLabResult {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub notes: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl NewLabResult {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        original_filename: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            original_filename: original_filename.into(),
            mime_type: mime_type.into(),
            file_size,
            notes: None,
            uploaded_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Output of the extraction stage as stored under `metadata.biomarkers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiomarkerSection {
    pub biomarkers: Vec<BiomarkerRecord>,
    pub parsing_errors: Vec<String>,
    pub extracted_at: DateTime<Utc>,
}

impl BiomarkerSection {
    #[must_use]
    pub fn from_output(output: ExtractionOutput, extracted_at: DateTime<Utc>) -> Self {
        Self {
            biomarkers: output.biomarkers,
            parsing_errors: output.parsing_errors,
            extracted_at,
        }
    }
}

/// Per-stage results. Each stage owns one key and later stages never touch
/// earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessed_text: Option<PreprocessedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biomarkers: Option<BiomarkerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabResult {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_ref: Option<String>,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub status: UploadStatus,
    pub uploaded_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub metadata: LabMetadata,
}

/// A biomarker row joined back to the upload it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBiomarker {
    pub lab_result_id: Uuid,
    #[serde(flatten)]
    pub record: BiomarkerRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSummary {
    pub lab_result_id: Uuid,
    pub original_filename: String,
    pub summary: String,
    pub summarized_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_metadata_serializes_to_empty_object() {
        let json = serde_json::to_string(&LabMetadata::default()).unwrap();
        assert_eq!(json, "{}");
        let back: LabMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(back, LabMetadata::default());
    }

    #[test]
    fn test_biomarker_section_shape() {
        let section = BiomarkerSection::from_output(ExtractionOutput::new(), Utc::now());
        let json = serde_json::to_value(&section).unwrap();
        assert_eq!(json["biomarkers"], serde_json::json!([]));
        assert_eq!(json["parsingErrors"], serde_json::json!([]));
        assert!(json["extractedAt"].is_string());
    }
}
