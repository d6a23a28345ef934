use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use labtrace_core::ingest::{OcrEngine, TesseractOcr};
use labtrace_core::{
    CompletionConfig, InMemoryProgressStore, LabStore, LocalObjectStore, LookupService,
    OpenAiSummarizer, PipelineConfig, ProgressStore, ReaderRegistry, Storage, UploadOrchestrator,
    UploadQuota, Vocabulary,
};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: UploadOrchestrator,
    pub store: Arc<dyn LabStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub lookup: Arc<LookupService>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wires the pipeline from environment configuration: SQLite store,
    /// local file storage, optional OCR and summarization.
    pub async fn from_config(
        config: ServerConfig,
        pipeline: PipelineConfig,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store: Arc<dyn LabStore> = Arc::new(Storage::open(&config.db_path).await?);
        let objects = Arc::new(LocalObjectStore::new(&config.storage_dir).await?);
        let progress: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());

        let vocabulary = match &pipeline.vocabulary_path {
            Some(path) => Arc::new(Vocabulary::load(path)?),
            None => Arc::new(Vocabulary::builtin()),
        };
        tracing::info!(entries = vocabulary.len(), "loaded biomarker vocabulary");

        let ocr = TesseractOcr::detect(pipeline.ocr_timeout)
            .map(|engine| Arc::new(engine) as Arc<dyn OcrEngine>);
        if ocr.is_none() {
            tracing::warn!("tesseract not found, image uploads are disabled");
        }
        let readers = ReaderRegistry::with_defaults(pipeline.scanned_page_min_chars, ocr);

        let mut orchestrator =
            UploadOrchestrator::new(pipeline.clone(), store.clone(), objects, progress.clone())
                .with_readers(readers)
                .with_vocabulary(vocabulary.clone());

        if let Some(max) = pipeline.upload_quota {
            orchestrator = orchestrator.with_tier_limits(Arc::new(UploadQuota::new(
                store.clone(),
                max,
                pipeline.upload_quota_period,
            )));
        }

        let completion = CompletionConfig::from_env();
        if completion.is_enabled() {
            let summarizer = OpenAiSummarizer::new(&completion)?;
            orchestrator = orchestrator.with_summarizer(Arc::new(summarizer));
            tracing::info!(model = %completion.model, "summarization enabled");
        }

        Ok(Self::new(orchestrator, store, progress, vocabulary, config))
    }

    pub fn new(
        orchestrator: UploadOrchestrator,
        store: Arc<dyn LabStore>,
        progress: Arc<dyn ProgressStore>,
        vocabulary: Arc<Vocabulary>,
        config: ServerConfig,
    ) -> Self {
        Self {
            orchestrator,
            lookup: Arc::new(LookupService::new(store.clone(), vocabulary)),
            store,
            progress,
            config: Arc::new(config),
        }
    }

    /// Drops progress for uploads that finished more than `progress_ttl` ago.
    pub async fn purge_expired_progress(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.progress_ttl).unwrap_or_default();
        self.progress.purge_finished(Utc::now() - ttl).await
    }

    /// Runs [`Self::purge_expired_progress`] once per `progress_ttl`.
    pub fn spawn_progress_purge(&self) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let period = state.config.progress_ttl.max(Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let purged = state.purge_expired_progress().await;
                if purged > 0 {
                    tracing::debug!(purged, "purged finished upload progress");
                }
            }
        })
    }
}
