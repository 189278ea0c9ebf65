//! API error types and HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use campus_billing::BillingError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payment required: {0}")]
    PaymentRequired(String),

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("upstream provider error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may retry the same request unchanged.
    fn retryable(&self) -> bool {
        matches!(
            self,
            ApiError::ServiceUnavailable | ApiError::Upstream(_) | ApiError::Database(_)
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::warn!(error = %self, status = %status, "Request rejected");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "retryable": self.retryable(),
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::CourseIsFree
            | BillingError::PurchaseAlreadyOpen
            | BillingError::NoActivePrice { .. } => ApiError::Validation(e.to_string()),
            BillingError::PaymentFailed(reason) => ApiError::PaymentRequired(reason),
            BillingError::ConfirmationTimeout => {
                ApiError::Upstream("Payment confirmation timed out".to_string())
            }
            BillingError::StripeApi(msg) => ApiError::Upstream(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::MissingConfig(_) => ApiError::ServiceUnavailable,
            BillingError::WebhookEventNotSupported(msg) | BillingError::Internal(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_not_retryable() {
        assert!(!ApiError::Validation("bad pricing type".into()).retryable());
        assert!(!ApiError::PaymentRequired("card_declined".into()).retryable());
        assert!(ApiError::Upstream("stripe 503".into()).retryable());
    }

    #[test]
    fn test_billing_error_mapping() {
        let err: ApiError = BillingError::PurchaseAlreadyOpen.into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = BillingError::WebhookSignatureInvalid.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = BillingError::PaymentFailed("declined".into()).into();
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);

        let err: ApiError = BillingError::StripeApi("timeout".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
