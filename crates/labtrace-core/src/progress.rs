use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Uploading,
    Processing,
    Extracting,
    Summarizing,
    Completed,
    Error,
    Retrying,
}

impl UploadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Extracting => "extracting",
            Self::Summarizing => "summarizing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Retrying => "retrying",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UploadStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "processing" => Ok(Self::Processing),
            "extracting" => Ok(Self::Extracting),
            "summarizing" => Ok(Self::Summarizing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "retrying" => Ok(Self::Retrying),
            _ => Err(crate::Error::InvalidStatus(s.to_string())),
        }
    }
}

/// Polling view of one upload, keyed by lab result id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub status: UploadStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

impl UploadProgress {
    #[must_use]
    pub fn new(status: UploadStatus, progress: u8) -> Self {
        Self {
            status,
            progress: progress.min(100),
            message: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Carries forward the highest progress seen so far so polling clients
    /// never observe the bar moving backwards.
    #[must_use]
    pub fn after(mut self, previous: Option<&Self>) -> Self {
        if let Some(prev) = previous {
            self.progress = self.progress.max(prev.progress);
        }
        self
    }
}

/// Where upload progress lives between stage transitions.
///
/// The in-process map is the default; a shared cache can implement this for
/// multi-process deployments without touching the pipeline.
#[async_trait::async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Option<UploadProgress>;

    async fn set(&self, id: Uuid, progress: UploadProgress);

    async fn remove(&self, id: Uuid);

    /// Drops terminal entries last updated before `older_than`. Returns how
    /// many were dropped.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> usize;
}

#[derive(Default)]
pub struct InMemoryProgressStore {
    entries: RwLock<HashMap<Uuid, UploadProgress>>,
}

impl InMemoryProgressStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get(&self, id: Uuid) -> Option<UploadProgress> {
        self.entries.read().await.get(&id).cloned()
    }

    async fn set(&self, id: Uuid, progress: UploadProgress) {
        let mut entries = self.entries.write().await;
        let progress = progress.after(entries.get(&id));
        entries.insert(id, progress);
    }

    async fn remove(&self, id: Uuid) {
        self.entries.write().await.remove(&id);
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, p| !(p.status.is_terminal() && p.updated_at < older_than));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_str() {
        assert_eq!("retrying".parse::<UploadStatus>().unwrap(), UploadStatus::Retrying);
        assert!("queued".parse::<UploadStatus>().is_err());
        assert!(UploadStatus::Error.is_terminal());
        assert!(!UploadStatus::Retrying.is_terminal());
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let store = InMemoryProgressStore::new();
        let id = Uuid::new_v4();

        store.set(id, UploadProgress::new(UploadStatus::Extracting, 55)).await;
        store.set(id, UploadProgress::new(UploadStatus::Retrying, 10)).await;

        let current = store.get(id).await.unwrap();
        assert_eq!(current.status, UploadStatus::Retrying);
        assert_eq!(current.progress, 55);
    }

    #[tokio::test]
    async fn test_purge_only_drops_finished_entries() {
        let store = InMemoryProgressStore::new();
        let done = Uuid::new_v4();
        let running = Uuid::new_v4();

        store.set(done, UploadProgress::new(UploadStatus::Completed, 100)).await;
        store.set(running, UploadProgress::new(UploadStatus::Processing, 25)).await;

        let purged = store.purge_finished(Utc::now() + chrono::Duration::seconds(1)).await;

        assert_eq!(purged, 1);
        assert!(store.get(done).await.is_none());
        assert!(store.get(running).await.is_some());
    }

    #[test]
    fn test_progress_json_shape() {
        let progress = UploadProgress::new(UploadStatus::Error, 40).with_error("boom");
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["progress"], 40);
        assert_eq!(json["error"], "boom");
        assert!(json.get("message").is_none());
    }
}
