use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use uuid::Uuid;

use crate::{
    biomarker::BiomarkerRecord,
    ingest::PreprocessedText,
    lab_result::{
        BiomarkerSection, LabMetadata, LabResult, NewLabResult, StoredBiomarker, StoredSummary,
    },
    progress::UploadStatus,
    Error, Result,
};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS lab_results (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    file_ref TEXT,
    original_filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    status TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,
    notes TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_lab_results_user ON lab_results(user_id, uploaded_at);

CREATE TABLE IF NOT EXISTS biomarkers (
    id TEXT PRIMARY KEY,
    lab_result_id TEXT NOT NULL REFERENCES lab_results(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL DEFAULT '',
    reference_range TEXT,
    test_date TEXT,
    category TEXT
);

CREATE INDEX IF NOT EXISTS idx_biomarkers_user ON biomarkers(user_id);
CREATE INDEX IF NOT EXISTS idx_biomarkers_lab ON biomarkers(lab_result_id);
"#;

/// Relational persistence for lab results and their biomarker rows.
///
/// Stage writes go through dedicated methods so each one touches only its own
/// metadata key, and a later stage cannot land before the earlier one.
#[async_trait::async_trait]
pub trait LabStore: Send + Sync {
    async fn create_lab_result(&self, new: &NewLabResult) -> Result<()>;

    /// Only returns the row when it belongs to `user_id`.
    async fn get_lab_result(&self, id: Uuid, user_id: Uuid) -> Result<LabResult>;

    async fn exists(&self, id: Uuid) -> Result<bool>;

    async fn set_status(&self, id: Uuid, status: UploadStatus) -> Result<()>;

    async fn set_file_ref(&self, id: Uuid, file_ref: &str) -> Result<()>;

    async fn set_preprocessed_text(&self, id: Uuid, text: &PreprocessedText) -> Result<()>;

    /// Writes `metadata.biomarkers` and replaces the normalized biomarker rows.
    async fn set_biomarkers(&self, id: Uuid, section: &BiomarkerSection) -> Result<()>;

    async fn set_summary(
        &self,
        id: Uuid,
        summary: &str,
        summarized_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_lab_result(&self, id: Uuid, user_id: Uuid) -> Result<()>;

    async fn count_uploads_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<u64>;

    async fn list_biomarkers_for_user(&self, user_id: Uuid) -> Result<Vec<StoredBiomarker>>;

    async fn list_summaries_for_user(&self, user_id: Uuid) -> Result<Vec<StoredSummary>>;
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidRow(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|_| Error::InvalidRow(format!("bad uuid {raw:?}")))
}

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Distinguishes "row gone" from "previous stage missing" after a guarded
    /// update touched nothing.
    async fn stage_write_failed(&self, id: Uuid, stage: &'static str) -> Error {
        match self.exists(id).await {
            Ok(true) => Error::StageOrder { id, stage },
            Ok(false) => Error::LabResultNotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl LabStore for Storage {
    async fn create_lab_result(&self, new: &NewLabResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lab_results
                (id, user_id, file_ref, original_filename, mime_type, file_size, status,
                 uploaded_at, notes, metadata)
            VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, '{}')
            "#,
        )
        .bind(new.id.to_string())
        .bind(new.user_id.to_string())
        .bind(&new.original_filename)
        .bind(&new.mime_type)
        .bind(i64::try_from(new.file_size).unwrap_or(i64::MAX))
        .bind(UploadStatus::Uploading.as_str())
        .bind(timestamp(new.uploaded_at))
        .bind(&new.notes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_lab_result(&self, id: Uuid, user_id: Uuid) -> Result<LabResult> {
        let row: LabResultRow = sqlx::query_as(
            r#"
            SELECT id, user_id, file_ref, original_filename, mime_type, file_size, status,
                   uploaded_at, notes, metadata
            FROM lab_results WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::LabResultNotFound(id))?;

        parse_lab_result_row(row)
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM lab_results WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn set_status(&self, id: Uuid, status: UploadStatus) -> Result<()> {
        let result = sqlx::query("UPDATE lab_results SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LabResultNotFound(id));
        }

        Ok(())
    }

    async fn set_file_ref(&self, id: Uuid, file_ref: &str) -> Result<()> {
        let result = sqlx::query("UPDATE lab_results SET file_ref = ? WHERE id = ?")
            .bind(file_ref)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LabResultNotFound(id));
        }

        Ok(())
    }

    async fn set_preprocessed_text(&self, id: Uuid, text: &PreprocessedText) -> Result<()> {
        let json = serde_json::to_string(text)?;

        let result = sqlx::query(
            "UPDATE lab_results SET metadata = json_set(metadata, '$.preprocessedText', json(?)) \
             WHERE id = ?",
        )
        .bind(json)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LabResultNotFound(id));
        }

        Ok(())
    }

    async fn set_biomarkers(&self, id: Uuid, section: &BiomarkerSection) -> Result<()> {
        let json = serde_json::to_string(section)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE lab_results SET metadata = json_set(metadata, '$.biomarkers', json(?))
            WHERE id = ? AND json_extract(metadata, '$.preprocessedText') IS NOT NULL
            "#,
        )
        .bind(json)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.stage_write_failed(id, "biomarkers").await);
        }

        let (user_id,): (String,) = sqlx::query_as("SELECT user_id FROM lab_results WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM biomarkers WHERE lab_result_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        for (position, record) in section.biomarkers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO biomarkers
                    (id, lab_result_id, user_id, position, name, value, unit, reference_range,
                     test_date, category)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::now_v7().to_string())
            .bind(id.to_string())
            .bind(&user_id)
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(&record.name)
            .bind(record.value)
            .bind(&record.unit)
            .bind(&record.reference_range)
            .bind(record.test_date.map(|d| d.format("%Y-%m-%d").to_string()))
            .bind(record.category.map(|c| c.as_str()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_summary(
        &self,
        id: Uuid,
        summary: &str,
        summarized_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE lab_results
            SET metadata = json_set(metadata, '$.summary', ?, '$.summarizedAt', ?)
            WHERE id = ? AND json_extract(metadata, '$.biomarkers') IS NOT NULL
            "#,
        )
        .bind(summary)
        .bind(timestamp(summarized_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stage_write_failed(id, "summary").await);
        }

        Ok(())
    }

    async fn delete_lab_result(&self, id: Uuid, user_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM lab_results WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::LabResultNotFound(id));
        }

        sqlx::query("DELETE FROM biomarkers WHERE lab_result_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_uploads_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM lab_results WHERE user_id = ? AND uploaded_at >= ?",
        )
        .bind(user_id.to_string())
        .bind(timestamp(since))
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_biomarkers_for_user(&self, user_id: Uuid) -> Result<Vec<StoredBiomarker>> {
        let rows: Vec<BiomarkerRow> = sqlx::query_as(
            r#"
            SELECT lab_result_id, name, value, unit, reference_range, test_date, category
            FROM biomarkers WHERE user_id = ?
            ORDER BY lab_result_id, position
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_biomarker_row).collect()
    }

    async fn list_summaries_for_user(&self, user_id: Uuid) -> Result<Vec<StoredSummary>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, original_filename, json_extract(metadata, '$.summary'),
                   json_extract(metadata, '$.summarizedAt')
            FROM lab_results
            WHERE user_id = ? AND json_extract(metadata, '$.summary') IS NOT NULL
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, original_filename, summary, summarized_at)| {
                Ok(StoredSummary {
                    lab_result_id: parse_uuid(&id)?,
                    original_filename,
                    summary,
                    summarized_at: summarized_at.as_deref().map(parse_timestamp).transpose()?,
                })
            })
            .collect()
    }
}

type LabResultRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    String,
);

fn parse_lab_result_row(row: LabResultRow) -> Result<LabResult> {
    let (
        id,
        user_id,
        file_ref,
        original_filename,
        mime_type,
        file_size,
        status,
        uploaded_at,
        notes,
        metadata,
    ) = row;

    let metadata: LabMetadata = serde_json::from_str(&metadata)?;

    Ok(LabResult {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        file_ref,
        original_filename,
        mime_type,
        file_size: u64::try_from(file_size).unwrap_or(0),
        status: status.parse()?,
        uploaded_at: parse_timestamp(&uploaded_at)?,
        notes,
        metadata,
    })
}

type BiomarkerRow = (
    String,
    String,
    f64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn parse_biomarker_row(row: BiomarkerRow) -> Result<StoredBiomarker> {
    let (lab_result_id, name, value, unit, reference_range, test_date, category) = row;

    let test_date = test_date
        .map(|d| {
            NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .map_err(|e| Error::InvalidRow(format!("bad test date {d:?}: {e}")))
        })
        .transpose()?;

    Ok(StoredBiomarker {
        lab_result_id: parse_uuid(&lab_result_id)?,
        record: BiomarkerRecord {
            name,
            value,
            unit,
            reference_range,
            test_date,
            category: category.map(|c| c.parse()).transpose()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biomarker::BiomarkerCategory;
    use crate::ingest::{DocumentFormat, ExtractionOutput, Preprocessor};

    fn new_result(user_id: Uuid) -> NewLabResult {
        NewLabResult::new(user_id, "panel.pdf", "application/pdf", 1024).with_notes("fasting")
    }

    fn section() -> BiomarkerSection {
        let mut output = ExtractionOutput::new();
        output.biomarkers.push(
            BiomarkerRecord::new("HDL Cholesterol", 55.0)
                .unwrap()
                .with_unit("mg/dL")
                .with_category(BiomarkerCategory::Lipid)
                .with_test_date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()),
        );
        BiomarkerSection::from_output(output, Utc::now())
    }

    #[tokio::test]
    async fn test_lab_result_crud() {
        let storage = Storage::open_memory().await.unwrap();
        let user = Uuid::new_v4();
        let new = new_result(user);

        storage.create_lab_result(&new).await.unwrap();
        assert!(storage.exists(new.id).await.unwrap());

        let row = storage.get_lab_result(new.id, user).await.unwrap();
        assert_eq!(row.status, UploadStatus::Uploading);
        assert_eq!(row.notes.as_deref(), Some("fasting"));
        assert_eq!(row.metadata, LabMetadata::default());

        storage.set_file_ref(new.id, "files/abc_panel.pdf").await.unwrap();
        storage.set_status(new.id, UploadStatus::Processing).await.unwrap();
        let row = storage.get_lab_result(new.id, user).await.unwrap();
        assert_eq!(row.file_ref.as_deref(), Some("files/abc_panel.pdf"));
        assert_eq!(row.status, UploadStatus::Processing);

        storage.delete_lab_result(new.id, user).await.unwrap();
        assert!(!storage.exists(new.id).await.unwrap());
        assert!(matches!(
            storage.set_status(new.id, UploadStatus::Completed).await,
            Err(Error::LabResultNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_are_user_scoped() {
        let storage = Storage::open_memory().await.unwrap();
        let owner = Uuid::new_v4();
        let new = new_result(owner);
        storage.create_lab_result(&new).await.unwrap();

        let other = Uuid::new_v4();
        assert!(storage.get_lab_result(new.id, other).await.is_err());
        assert!(storage.delete_lab_result(new.id, other).await.is_err());
        assert!(storage.exists(new.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_order_enforced() {
        let storage = Storage::open_memory().await.unwrap();
        let user = Uuid::new_v4();
        let new = new_result(user);
        storage.create_lab_result(&new).await.unwrap();

        let err = storage.set_biomarkers(new.id, &section()).await.unwrap_err();
        assert!(matches!(err, Error::StageOrder { stage: "biomarkers", .. }));

        let err = storage.set_summary(new.id, "ok", Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::StageOrder { stage: "summary", .. }));
    }

    #[tokio::test]
    async fn test_stage_writes_do_not_clobber() {
        let storage = Storage::open_memory().await.unwrap();
        let user = Uuid::new_v4();
        let new = new_result(user);
        storage.create_lab_result(&new).await.unwrap();

        let text =
            Preprocessor::default().preprocess("HDL Cholesterol 55 mg/dL", DocumentFormat::Pdf);
        storage.set_preprocessed_text(new.id, &text).await.unwrap();
        storage.set_biomarkers(new.id, &section()).await.unwrap();
        storage.set_summary(new.id, "Cholesterol looks fine.", Utc::now()).await.unwrap();

        let row = storage.get_lab_result(new.id, user).await.unwrap();
        assert_eq!(row.metadata.preprocessed_text.as_ref(), Some(&text));
        assert_eq!(row.metadata.biomarkers.as_ref().unwrap().biomarkers.len(), 1);
        assert_eq!(row.metadata.summary.as_deref(), Some("Cholesterol looks fine."));
        assert!(row.metadata.summarized_at.is_some());

        let stored = storage.list_biomarkers_for_user(user).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].lab_result_id, new.id);
        assert_eq!(stored[0].record.category, Some(BiomarkerCategory::Lipid));

        let summaries = storage.list_summaries_for_user(user).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(storage.list_summaries_for_user(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewriting_biomarkers_replaces_rows() {
        let storage = Storage::open_memory().await.unwrap();
        let user = Uuid::new_v4();
        let new = new_result(user);
        storage.create_lab_result(&new).await.unwrap();
        let text = Preprocessor::default().preprocess("x", DocumentFormat::PlainText);
        storage.set_preprocessed_text(new.id, &text).await.unwrap();

        storage.set_biomarkers(new.id, &section()).await.unwrap();
        storage.set_biomarkers(new.id, &section()).await.unwrap();

        assert_eq!(storage.list_biomarkers_for_user(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_count_uploads_since() {
        let storage = Storage::open_memory().await.unwrap();
        let user = Uuid::new_v4();
        let mut old = new_result(user);
        old.uploaded_at = Utc::now() - chrono::Duration::days(40);
        storage.create_lab_result(&old).await.unwrap();
        storage.create_lab_result(&new_result(user)).await.unwrap();

        let since = Utc::now() - chrono::Duration::days(30);
        assert_eq!(storage.count_uploads_since(user, since).await.unwrap(), 1);
        assert_eq!(storage.count_uploads_since(Uuid::new_v4(), since).await.unwrap(), 0);
    }
}
