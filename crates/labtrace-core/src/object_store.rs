use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable home for the raw uploaded bytes. The returned `file_ref` is opaque
/// to callers and is what gets persisted on the lab result row.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn save(&self, data: &[u8], suggested_name: &str) -> StorageResult<String>;

    async fn load(&self, file_ref: &str) -> StorageResult<Vec<u8>>;

    async fn delete(&self, file_ref: &str) -> StorageResult<()>;
}

/// Keeps only characters that are safe in a single path segment.
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(128).collect()
    }
}

/// Filesystem-backed object store rooted at one directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects keys that could leave the base directory.
    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalObjectStore {
    async fn save(&self, data: &[u8], suggested_name: &str) -> StorageResult<String> {
        let key = format!("{}_{}", Uuid::now_v7(), sanitize_filename(suggested_name));
        let path = self.key_to_path(&key)?;

        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;

        tracing::debug!(file_ref = %key, bytes = data.len(), "stored upload");
        Ok(key)
    }

    async fn load(&self, file_ref: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(file_ref)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(file_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, file_ref: &str) -> StorageResult<()> {
        let path = self.key_to_path(file_ref)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
