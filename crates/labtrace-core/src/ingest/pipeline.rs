use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::extractor::BiomarkerExtractor;
use super::preprocessor::{PreprocessedText, Preprocessor};
use super::reader::{FormatExtractionError, ReaderError, ReaderRegistry};
use super::vocabulary::Vocabulary;
use crate::completion::Summarizer;
use crate::config::PipelineConfig;
use crate::lab_result::{BiomarkerSection, NewLabResult};
use crate::object_store::{ObjectStore, StorageError};
use crate::progress::{ProgressStore, UploadProgress, UploadStatus};
use crate::storage::LabStore;
use crate::tier::{TierLimits, Unlimited};

/// Unit of work inside the per-upload state machine. Used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Accept,
    Save,
    Read,
    Preprocess,
    Extract,
    Summarize,
    Complete,
}

impl Stage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Save => "save",
            Self::Read => "read",
            Self::Preprocess => "preprocess",
            Self::Extract => "extract",
            Self::Summarize => "summarize",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Problems with the upload itself. Reported before any stage runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unsupported file type: {0}")]
    UnsupportedMimeType(String),
    #[error("File is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("File is empty")]
    Empty,
    #[error("Lab upload limit reached for your plan")]
    QuotaExceeded,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Format(#[from] FormatExtractionError),
    #[error("Temporary failure in {stage} stage: {cause}")]
    Transient { stage: Stage, cause: String },
    #[error("{stage} stage failed: {cause}")]
    Fatal { stage: Stage, cause: String },
    #[error("Lab result was deleted while processing")]
    Deleted,
}

impl IngestError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Text safe to show the uploader. Parser internals stay in the logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Format(e) => e.user_message(),
            Self::Transient { cause, .. } => {
                format!("Processing stopped after repeated temporary failures: {cause}")
            }
            Self::Fatal { .. } => {
                "Processing failed. Please try uploading the file again.".to_string()
            }
            Self::Deleted => "This lab result was deleted.".to_string(),
        }
    }

    fn from_store(stage: Stage, err: crate::Error) -> Self {
        match err {
            crate::Error::LabResultNotFound(_) => Self::Deleted,
            e if e.is_transient() => Self::Transient {
                stage,
                cause: e.to_string(),
            },
            e => Self::Fatal {
                stage,
                cause: e.to_string(),
            },
        }
    }

    fn from_object_store(err: StorageError) -> Self {
        if err.is_transient() {
            Self::Transient {
                stage: Stage::Save,
                cause: err.to_string(),
            }
        } else {
            Self::Fatal {
                stage: Stage::Save,
                cause: err.to_string(),
            }
        }
    }

    fn from_reader(err: ReaderError) -> Self {
        match err {
            ReaderError::Format(e) => Self::Format(e),
            ReaderError::UnsupportedFormat(mime) => {
                ValidationError::UnsupportedMimeType(mime).into()
            }
            ReaderError::Ocr(e) if e.is_transient() => Self::Transient {
                stage: Stage::Read,
                cause: e.to_string(),
            },
            ReaderError::Ocr(e) => Self::Fatal {
                stage: Stage::Read,
                cause: e.to_string(),
            },
        }
    }

    fn timed_out(stage: Stage, after: Duration) -> Self {
        Self::Transient {
            stage,
            cause: format!("timed out after {after:?}"),
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// An uploaded file as handed over by the HTTP layer.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: Uuid,
    pub original_filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub notes: Option<String>,
}

impl UploadRequest {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        original_filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            user_id,
            original_filename: original_filename.into(),
            mime_type: mime_type.into(),
            data,
            notes: None,
        }
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Returned once the upload is accepted and its background task started.
#[derive(Debug)]
pub struct SubmittedUpload {
    pub id: Uuid,
    pub handle: JoinHandle<()>,
}

struct Job {
    id: Uuid,
    user_id: Uuid,
    original_filename: String,
    mime_type: String,
    data: Vec<u8>,
    uploaded_at: DateTime<Utc>,
}

/// Results of stages that already succeeded, so a retry resumes after them.
#[derive(Default)]
struct Checkpoint {
    file_ref: Option<String>,
    preprocessed: Option<PreprocessedText>,
    biomarkers: Option<BiomarkerSection>,
    summarized: bool,
}

/// `"Text/Plain; charset=utf-8"` becomes `"text/plain"`.
fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Exponential delay before retry `attempt` (1-based), capped at `max`.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Drives every accepted upload through save, read, preprocess, extract and
/// summarize, publishing progress at each transition.
///
/// Each upload runs as its own tokio task. Cloning is cheap and shares the
/// collaborators.
#[derive(Clone)]
pub struct UploadOrchestrator {
    config: Arc<PipelineConfig>,
    readers: Arc<ReaderRegistry>,
    preprocessor: Arc<Preprocessor>,
    extractor: Arc<BiomarkerExtractor>,
    store: Arc<dyn LabStore>,
    objects: Arc<dyn ObjectStore>,
    progress: Arc<dyn ProgressStore>,
    tier: Arc<dyn TierLimits>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl UploadOrchestrator {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn LabStore>,
        objects: Arc<dyn ObjectStore>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        let readers = ReaderRegistry::with_defaults(config.scanned_page_min_chars, None);
        let preprocessor = Preprocessor::new(config.preprocess.clone());
        Self {
            config: Arc::new(config),
            readers: Arc::new(readers),
            preprocessor: Arc::new(preprocessor),
            extractor: Arc::new(BiomarkerExtractor::default()),
            store,
            objects,
            progress,
            tier: Arc::new(Unlimited),
            summarizer: None,
        }
    }

    #[must_use]
    pub fn with_readers(mut self, readers: ReaderRegistry) -> Self {
        self.readers = Arc::new(readers);
        self
    }

    #[must_use]
    pub fn with_vocabulary(mut self, vocabulary: Arc<Vocabulary>) -> Self {
        self.preprocessor = Arc::new(
            Preprocessor::new(self.config.preprocess.clone())
                .with_vocabulary(Arc::clone(&vocabulary)),
        );
        self.extractor = Arc::new(BiomarkerExtractor::new(vocabulary));
        self
    }

    #[must_use]
    pub fn with_tier_limits(mut self, tier: Arc<dyn TierLimits>) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn progress(&self, id: Uuid) -> Option<UploadProgress> {
        self.progress.get(id).await
    }

    fn validate(&self, upload: &UploadRequest, mime_type: &str) -> Result<(), ValidationError> {
        if !self.config.allows_mime_type(mime_type) || !self.readers.supports(mime_type) {
            return Err(ValidationError::UnsupportedMimeType(mime_type.to_string()));
        }

        let size = upload.data.len() as u64;
        if size > self.config.max_upload_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.config.max_upload_bytes,
            });
        }
        if size == 0 {
            return Err(ValidationError::Empty);
        }

        Ok(())
    }

    /// Checks the tier limit and the file, creates the lab result row in
    /// `uploading` and spawns the background task.
    ///
    /// Nothing is stored when validation fails.
    pub async fn submit(&self, upload: UploadRequest) -> IngestResult<SubmittedUpload> {
        let allowed = self
            .tier
            .can_upload_lab(upload.user_id)
            .await
            .map_err(|e| IngestError::from_store(Stage::Accept, e))?;
        if !allowed {
            info!(user_id = %upload.user_id, "upload rejected: quota exceeded");
            return Err(ValidationError::QuotaExceeded.into());
        }

        let mime_type = essence(&upload.mime_type);
        if let Err(e) = self.validate(&upload, &mime_type) {
            info!(user_id = %upload.user_id, error = %e, "upload rejected");
            return Err(e.into());
        }

        let mut new = NewLabResult::new(
            upload.user_id,
            upload.original_filename.clone(),
            mime_type.clone(),
            upload.data.len() as u64,
        );
        if let Some(notes) = upload.notes {
            new = new.with_notes(notes);
        }

        self.store
            .create_lab_result(&new)
            .await
            .map_err(|e| IngestError::from_store(Stage::Accept, e))?;

        self.progress
            .set(
                new.id,
                UploadProgress::new(UploadStatus::Uploading, 0).with_message("Upload received"),
            )
            .await;

        info!(
            lab_result_id = %new.id,
            user_id = %new.user_id,
            mime_type = %mime_type,
            bytes = new.file_size,
            "accepted lab upload"
        );

        let job = Job {
            id: new.id,
            user_id: new.user_id,
            original_filename: new.original_filename,
            mime_type,
            data: upload.data,
            uploaded_at: new.uploaded_at,
        };

        let orchestrator = self.clone();
        let handle = tokio::spawn(async move { orchestrator.run(job).await });

        Ok(SubmittedUpload { id: new.id, handle })
    }

    /// Deletes the caller's lab result along with its stored file and progress
    /// entry. An in-flight task notices at its next transition and stops.
    pub async fn delete(&self, id: Uuid, user_id: Uuid) -> crate::Result<()> {
        let lab = self.store.get_lab_result(id, user_id).await?;
        self.store.delete_lab_result(id, user_id).await?;
        self.progress.remove(id).await;

        if let Some(file_ref) = lab.file_ref {
            if let Err(e) = self.objects.delete(&file_ref).await {
                warn!(
                    lab_result_id = %id,
                    file_ref = %file_ref,
                    error = %e,
                    "failed to delete stored file"
                );
            }
        }

        info!(lab_result_id = %id, user_id = %user_id, "deleted lab result");
        Ok(())
    }

    async fn run(self, job: Job) {
        let mut checkpoint = Checkpoint::default();
        let mut attempt = 0u32;

        loop {
            match self.advance(&job, &mut checkpoint).await {
                Ok(()) => return,
                Err(IngestError::Deleted) => {
                    self.abandon(&job, &checkpoint).await;
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = with_jitter(backoff_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        attempt,
                    ));
                    warn!(
                        lab_result_id = %job.id,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transient failure, retrying"
                    );
                    if let Err(e) = self.store.set_status(job.id, UploadStatus::Retrying).await {
                        debug!(
                            lab_result_id = %job.id,
                            error = %e,
                            "could not record retrying status"
                        );
                    }
                    self.report(
                        job.id,
                        UploadProgress::new(UploadStatus::Retrying, 0).with_message(format!(
                            "Temporary problem, retrying (attempt {attempt} of {})",
                            self.config.max_retries
                        )),
                    )
                    .await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.fail(&job, &checkpoint, &e, attempt).await;
                    return;
                }
            }
        }
    }

    async fn advance(&self, job: &Job, checkpoint: &mut Checkpoint) -> IngestResult<()> {
        if checkpoint.file_ref.is_none() {
            let file_ref = self
                .bounded(Stage::Save, self.config.storage_timeout, async {
                    self.objects
                        .save(&job.data, &job.original_filename)
                        .await
                        .map_err(IngestError::from_object_store)
                })
                .await?;
            checkpoint.file_ref = Some(file_ref.clone());

            self.ensure_exists(job.id).await?;
            self.store_write(Stage::Save, self.store.set_file_ref(job.id, &file_ref))
                .await?;
            self.report(
                job.id,
                UploadProgress::new(UploadStatus::Uploading, 10).with_message("File stored"),
            )
            .await;
        }

        self.transition(job.id, UploadStatus::Processing, 25, "Reading document")
            .await?;
        if checkpoint.preprocessed.is_none() {
            let raw = self
                .bounded(Stage::Read, self.config.ocr_timeout, async {
                    self.readers
                        .extract(&job.data, &job.mime_type)
                        .await
                        .map_err(IngestError::from_reader)
                })
                .await
                .inspect_err(|e| {
                    if let IngestError::Format(cause) = e {
                        warn!(
                            lab_result_id = %job.id,
                            error = %cause,
                            "document could not be read"
                        );
                    }
                })?;

            let preprocessor = Arc::clone(&self.preprocessor);
            let text = tokio::task::spawn_blocking(move || preprocessor.preprocess_extraction(&raw))
                .await
                .map_err(|e| IngestError::Fatal {
                    stage: Stage::Preprocess,
                    cause: e.to_string(),
                })?;
            debug!(
                lab_result_id = %job.id,
                text_length = text.metadata().text_length,
                confidence = text.metadata().confidence_score.as_str(),
                "preprocessed document"
            );

            self.ensure_exists(job.id).await?;
            self.store_write(Stage::Preprocess, self.store.set_preprocessed_text(job.id, &text))
                .await?;
            checkpoint.preprocessed = Some(text);
        }

        self.transition(job.id, UploadStatus::Extracting, 55, "Extracting biomarkers")
            .await?;
        if checkpoint.biomarkers.is_none() {
            let text = checkpoint.preprocessed.as_ref().ok_or(IngestError::Fatal {
                stage: Stage::Extract,
                cause: "preprocessed text missing".to_string(),
            })?;
            let mut output = self.extractor.extract(text.normalized_text());
            output.fill_missing_dates(job.uploaded_at.date_naive());
            let section = BiomarkerSection::from_output(output, Utc::now());

            info!(
                lab_result_id = %job.id,
                biomarkers = section.biomarkers.len(),
                parsing_errors = section.parsing_errors.len(),
                "extracted biomarkers"
            );

            self.ensure_exists(job.id).await?;
            self.store_write(Stage::Extract, self.store.set_biomarkers(job.id, &section))
                .await?;
            checkpoint.biomarkers = Some(section);
        }

        self.transition(job.id, UploadStatus::Summarizing, 80, "Summarizing results")
            .await?;
        if !checkpoint.summarized {
            self.summarize(job, checkpoint).await?;
            checkpoint.summarized = true;
        }

        self.ensure_exists(job.id).await?;
        self.store_write(Stage::Complete, self.store.set_status(job.id, UploadStatus::Completed))
            .await?;
        let no_text = checkpoint
            .preprocessed
            .as_ref()
            .is_some_and(|text| text.normalized_text().is_empty());
        let message = if no_text {
            "No text found in document"
        } else {
            "Processing complete"
        };
        self.report(
            job.id,
            UploadProgress::new(UploadStatus::Completed, 100).with_message(message),
        )
        .await;

        info!(lab_result_id = %job.id, user_id = %job.user_id, "lab upload completed");
        Ok(())
    }

    /// Best effort: any failure other than deletion leaves the result
    /// without a summary.
    async fn summarize(&self, job: &Job, checkpoint: &Checkpoint) -> IngestResult<()> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(());
        };
        let (Some(text), Some(section)) = (&checkpoint.preprocessed, &checkpoint.biomarkers) else {
            return Ok(());
        };
        if text.normalized_text().is_empty() && section.biomarkers.is_empty() {
            debug!(lab_result_id = %job.id, "nothing to summarize");
            return Ok(());
        }

        let summary = match tokio::time::timeout(
            self.config.summary_timeout,
            summarizer.summarize(text.normalized_text(), &section.biomarkers),
        )
        .await
        {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                warn!(
                    lab_result_id = %job.id,
                    error = %e,
                    "summarization failed, completing without summary"
                );
                return Ok(());
            }
            Err(_) => {
                warn!(
                    lab_result_id = %job.id,
                    timeout_secs = self.config.summary_timeout.as_secs(),
                    "summarization timed out, completing without summary"
                );
                return Ok(());
            }
        };

        self.ensure_exists(job.id).await?;
        match self
            .store_write(Stage::Summarize, self.store.set_summary(job.id, &summary, Utc::now()))
            .await
        {
            Err(IngestError::Deleted) => Err(IngestError::Deleted),
            Err(e) => {
                warn!(
                    lab_result_id = %job.id,
                    error = %e,
                    "could not store summary, completing without it"
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        status: UploadStatus,
        progress: u8,
        message: &str,
    ) -> IngestResult<()> {
        self.ensure_exists(id).await?;
        self.store_write(stage_for(status), self.store.set_status(id, status))
            .await?;
        self.report(id, UploadProgress::new(status, progress).with_message(message))
            .await;
        Ok(())
    }

    async fn ensure_exists(&self, id: Uuid) -> IngestResult<()> {
        let exists = self
            .bounded(Stage::Accept, self.config.storage_timeout, async {
                self.store
                    .exists(id)
                    .await
                    .map_err(|e| IngestError::from_store(Stage::Accept, e))
            })
            .await?;
        if exists {
            Ok(())
        } else {
            Err(IngestError::Deleted)
        }
    }

    async fn store_write(
        &self,
        stage: Stage,
        write: impl Future<Output = crate::Result<()>> + Send,
    ) -> IngestResult<()> {
        self.bounded(stage, self.config.storage_timeout, async {
            write.await.map_err(|e| IngestError::from_store(stage, e))
        })
        .await
    }

    async fn bounded<T>(
        &self,
        stage: Stage,
        limit: Duration,
        work: impl Future<Output = IngestResult<T>> + Send,
    ) -> IngestResult<T> {
        tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(IngestError::timed_out(stage, limit)))
    }

    async fn report(&self, id: Uuid, progress: UploadProgress) {
        self.progress.set(id, progress).await;
    }

    async fn fail(&self, job: &Job, checkpoint: &Checkpoint, err: &IngestError, attempts: u32) {
        error!(
            lab_result_id = %job.id,
            user_id = %job.user_id,
            retries = attempts,
            error = %err,
            "lab upload failed"
        );

        match self.store.set_status(job.id, UploadStatus::Error).await {
            Err(crate::Error::LabResultNotFound(_)) => {
                self.abandon(job, checkpoint).await;
                return;
            }
            Err(e) => warn!(lab_result_id = %job.id, error = %e, "could not record error status"),
            Ok(()) => {}
        }

        self.report(
            job.id,
            UploadProgress::new(UploadStatus::Error, 0).with_error(err.user_message()),
        )
        .await;
    }

    /// The row is gone. Drop progress and any file this task stored.
    async fn abandon(&self, job: &Job, checkpoint: &Checkpoint) {
        info!(lab_result_id = %job.id, "lab result deleted during processing, stopping");
        self.progress.remove(job.id).await;
        if let Some(file_ref) = &checkpoint.file_ref {
            if let Err(e) = self.objects.delete(file_ref).await {
                warn!(
                    lab_result_id = %job.id,
                    file_ref = %file_ref,
                    error = %e,
                    "failed to delete orphaned file"
                );
            }
        }
    }
}

fn stage_for(status: UploadStatus) -> Stage {
    match status {
        UploadStatus::Uploading => Stage::Save,
        UploadStatus::Processing | UploadStatus::Retrying => Stage::Read,
        UploadStatus::Extracting => Stage::Extract,
        UploadStatus::Summarizing => Stage::Summarize,
        UploadStatus::Completed | UploadStatus::Error => Stage::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_essence() {
        assert_eq!(essence("Text/Plain; charset=utf-8"), "text/plain");
        assert_eq!(essence("application/pdf"), "application/pdf");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(3);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, max, 4), max);
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let delay = Duration::from_millis(400);
        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(500));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_user_message_hides_parser_cause() {
        let err = IngestError::Format(FormatExtractionError::new(
            "application/pdf",
            "xref table offset 0x3f2 invalid",
        ));
        assert!(!err.is_retryable());
        assert!(!err.user_message().contains("xref"));
        assert!(err.user_message().contains("application/pdf"));
    }

    #[test]
    fn test_store_error_classification() {
        let transient =
            IngestError::from_store(Stage::Extract, crate::Error::Unavailable("down".into()));
        assert!(transient.is_retryable());

        let gone =
            IngestError::from_store(Stage::Extract, crate::Error::LabResultNotFound(Uuid::nil()));
        assert!(matches!(gone, IngestError::Deleted));

        let fatal = IngestError::from_store(Stage::Extract, crate::Error::InvalidRow("x".into()));
        assert!(!fatal.is_retryable());
    }
}
