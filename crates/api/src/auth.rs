//! Authenticated-user extraction.
//!
//! Authentication itself is owned by the platform gateway, which verifies
//! the session and forwards the user id in the `x-user-id` header. This
//! extractor only validates presence and shape; requests that bypass the
//! gateway carry no header and are rejected.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::ApiError;

/// The authenticated platform user for this request.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ApiError::Unauthorized)?;

        Ok(AuthUser { user_id })
    }
}
