use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use labtrace_core::{
    Error, IngestError, LabResult, UploadProgress, UploadRequest, UploadStatus, ValidationError,
};
use serde::Serialize;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use crate::state::AppState;
use crate::user::CurrentUser;

/// Room for multipart boundaries and the notes field on top of the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route(
            "/",
            post(upload_lab)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
        .route("/{id}", get(get_lab).delete(delete_lab))
        .route("/{id}/progress", get(get_progress))
}

#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub id: Uuid,
    pub status: UploadStatus,
}

fn not_found_or_500(e: Error) -> (StatusCode, String) {
    match e {
        Error::LabResultNotFound(_) => (StatusCode::NOT_FOUND, "Lab result not found".to_string()),
        e => {
            tracing::error!(error = %e, "lab result request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn ingest_status(e: &IngestError) -> StatusCode {
    match e {
        IngestError::Validation(ValidationError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::Validation(ValidationError::QuotaExceeded) => StatusCode::TOO_MANY_REQUESTS,
        IngestError::Validation(_) => StatusCode::BAD_REQUEST,
        IngestError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        IngestError::Format(_) | IngestError::Fatal { .. } | IngestError::Deleted => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Mime type from the part header, falling back to the file extension.
fn resolve_mime_type(declared: Option<&str>, filename: &str) -> String {
    if let Some(mime) = declared.filter(|m| !m.is_empty() && *m != "application/octet-stream") {
        return mime.to_string();
    }

    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => labtrace_core::ingest::PDF_MIME,
        "docx" => labtrace_core::ingest::DOCX_MIME,
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" => labtrace_core::ingest::PLAIN_TEXT_MIME,
        _ => "application/octet-stream",
    }
    .to_string()
}

async fn upload_lab(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), (StatusCode, String)> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut notes: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let mime_type = resolve_mime_type(field.content_type(), &filename);
                let data = field.bytes().await.map_err(|e| (e.status(), e.body_text()))?;
                file = Some((filename, mime_type, data.to_vec()));
            }
            Some("notes") => {
                let text = field.text().await.map_err(|e| (e.status(), e.body_text()))?;
                notes = Some(text).filter(|n| !n.trim().is_empty());
            }
            _ => {}
        }
    }

    let (filename, mime_type, data) =
        file.ok_or_else(|| (StatusCode::BAD_REQUEST, "Missing file field".to_string()))?;

    let mut upload = UploadRequest::new(user_id, filename, mime_type, data);
    if let Some(notes) = notes {
        upload = upload.with_notes(notes);
    }

    let submitted = state
        .orchestrator
        .submit(upload)
        .await
        .map_err(|e| (ingest_status(&e), e.user_message()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            id: submitted.id,
            status: UploadStatus::Uploading,
        }),
    ))
}

async fn get_lab(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<LabResult>, (StatusCode, String)> {
    let lab = state
        .store
        .get_lab_result(id, user_id)
        .await
        .map_err(not_found_or_500)?;

    Ok(Json(lab))
}

/// Live progress while the task runs; once the entry has been purged the
/// stored status stands in.
async fn get_progress(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadProgress>, (StatusCode, String)> {
    let lab = state
        .store
        .get_lab_result(id, user_id)
        .await
        .map_err(not_found_or_500)?;

    let progress = match state.progress.get(id).await {
        Some(progress) => progress,
        None => {
            let percent = if lab.status == UploadStatus::Completed { 100 } else { 0 };
            UploadProgress::new(lab.status, percent)
        }
    };

    Ok(Json(progress))
}

async fn delete_lab(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .orchestrator
        .delete(id, user_id)
        .await
        .map_err(not_found_or_500)?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_mime_type() {
        assert_eq!(resolve_mime_type(Some("application/pdf"), "x.bin"), "application/pdf");
        assert_eq!(resolve_mime_type(None, "Panel.PDF"), "application/pdf");
        assert_eq!(resolve_mime_type(Some("application/octet-stream"), "scan.jpeg"), "image/jpeg");
        assert_eq!(resolve_mime_type(None, "notes"), "application/octet-stream");
    }

    #[test]
    fn test_ingest_status_codes() {
        let quota = IngestError::Validation(ValidationError::QuotaExceeded);
        assert_eq!(ingest_status(&quota), StatusCode::TOO_MANY_REQUESTS);
        let big = IngestError::Validation(ValidationError::TooLarge { size: 2, max: 1 });
        assert_eq!(ingest_status(&big), StatusCode::PAYLOAD_TOO_LARGE);
        let empty = IngestError::Validation(ValidationError::Empty);
        assert_eq!(ingest_status(&empty), StatusCode::BAD_REQUEST);
    }
}
