use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::storage::LabStore;
use crate::Result;

/// Gate consulted before an upload is accepted.
#[async_trait::async_trait]
pub trait TierLimits: Send + Sync {
    async fn can_upload_lab(&self, user_id: Uuid) -> Result<bool>;
}

pub struct Unlimited;

#[async_trait::async_trait]
impl TierLimits for Unlimited {
    async fn can_upload_lab(&self, _user_id: Uuid) -> Result<bool> {
        Ok(true)
    }
}

/// Caps uploads per user over a rolling window.
pub struct UploadQuota {
    store: Arc<dyn LabStore>,
    max_uploads: u64,
    period: Duration,
}

impl UploadQuota {
    #[must_use]
    pub fn new(store: Arc<dyn LabStore>, max_uploads: u64, period: Duration) -> Self {
        Self {
            store,
            max_uploads,
            period,
        }
    }
}

#[async_trait::async_trait]
impl TierLimits for UploadQuota {
    async fn can_upload_lab(&self, user_id: Uuid) -> Result<bool> {
        let period = chrono::Duration::from_std(self.period)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let since = Utc::now()
            .checked_sub_signed(period)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);
        let used = self.store.count_uploads_since(user_id, since).await?;
        Ok(used < self.max_uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab_result::NewLabResult;
    use crate::storage::Storage;

    #[tokio::test]
    async fn test_quota_counts_per_user() {
        let storage = Arc::new(Storage::open_memory().await.unwrap());
        let quota = UploadQuota::new(storage.clone(), 2, Duration::from_secs(3600));
        let user = Uuid::new_v4();

        for _ in 0..2 {
            assert!(quota.can_upload_lab(user).await.unwrap());
            storage
                .create_lab_result(&NewLabResult::new(user, "a.pdf", "application/pdf", 10))
                .await
                .unwrap();
        }

        assert!(!quota.can_upload_lab(user).await.unwrap());
        assert!(quota.can_upload_lab(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlimited() {
        assert!(Unlimited.can_upload_lab(Uuid::nil()).await.unwrap());
    }
}
