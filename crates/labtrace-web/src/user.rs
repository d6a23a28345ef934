use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use uuid::Uuid;

use crate::state::AppState;

pub const USER_HEADER: &str = "x-user-id";

/// Extractor for the caller's user id
///
/// Authentication happens upstream; this only reads the id it forwards.
pub struct CurrentUser(pub Uuid);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing X-User-Id header"))?;

        raw.to_str()
            .ok()
            .and_then(|v| v.trim().parse::<Uuid>().ok())
            .map(CurrentUser)
            .ok_or((StatusCode::BAD_REQUEST, "X-User-Id must be a UUID"))
    }
}
