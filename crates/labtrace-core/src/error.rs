use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Lab result not found: {0}")]
    LabResultNotFound(uuid::Uuid),

    #[error("Invalid upload status: {0}")]
    InvalidStatus(String),

    #[error("Invalid biomarker category: {0}")]
    InvalidCategory(String),

    #[error("Cannot write {stage} for lab result {id}: previous stage has not been stored")]
    StageOrder { id: uuid::Uuid, stage: &'static str },

    #[error("Invalid preprocessed text: {0}")]
    InvalidPreprocessedText(String),

    #[error("Invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Unavailable("db restarting".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::LabResultNotFound(uuid::Uuid::nil()).is_transient());
        assert!(!Error::InvalidStatus("bogus".into()).is_transient());
    }
}
