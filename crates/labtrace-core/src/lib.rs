pub mod biomarker;
pub mod completion;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lab_result;
pub mod lookup;
pub mod object_store;
pub mod progress;
pub mod storage;
pub mod tier;

pub use biomarker::{BiomarkerCategory, BiomarkerRecord};
pub use completion::{CompletionError, CompletionResult, OpenAiSummarizer, Summarizer};
pub use config::{CompletionConfig, PipelineConfig, PreprocessConfig};
pub use error::{Error, Result};
pub use ingest::{
    BiomarkerExtractor, IngestError, IngestResult, PreprocessedText, Preprocessor, ReaderRegistry,
    SubmittedUpload, UploadOrchestrator, UploadRequest, ValidationError, Vocabulary,
};
pub use lab_result::{LabMetadata, LabResult, NewLabResult, StoredBiomarker, StoredSummary};
pub use lookup::{BiomarkerMatch, LookupService, SummaryMatch};
pub use object_store::{LocalObjectStore, ObjectStore, StorageError};
pub use progress::{InMemoryProgressStore, ProgressStore, UploadProgress, UploadStatus};
pub use storage::{LabStore, Storage};
pub use tier::{TierLimits, Unlimited, UploadQuota};
