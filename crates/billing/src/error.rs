//! Billing error types.
//!
//! The taxonomy distinguishes transient provider failures (retryable),
//! validation errors (rejected immediately), signature failures (webhook
//! rejected, provider redelivers), and payment failures (valid outcomes,
//! not application errors).

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no active price for course {course_id} with billing period {billing_period}")]
    NoActivePrice {
        course_id: uuid::Uuid,
        billing_period: String,
    },

    #[error("course is free and cannot be purchased")]
    CourseIsFree,

    #[error("user already has an open purchase for this course")]
    PurchaseAlreadyOpen,

    #[error("payment confirmation timed out")]
    ConfirmationTimeout,

    #[error("payment did not succeed: {0}")]
    PaymentFailed(String),

    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl BillingError {
    /// Whether the caller may retry the operation.
    ///
    /// Provider and database failures are transient; validation and
    /// payment-outcome errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_) | BillingError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::StripeApi("503".into()).is_retryable());
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::CourseIsFree.is_retryable());
        assert!(!BillingError::PaymentFailed("card_declined".into()).is_retryable());
    }

    #[test]
    fn test_no_active_price_message() {
        let err = BillingError::NoActivePrice {
            course_id: uuid::Uuid::nil(),
            billing_period: "monthly".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("monthly"));
        assert!(msg.contains("no active price"));
    }
}
