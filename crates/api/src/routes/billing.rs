//! Billing routes for Stripe integration

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use campus_billing::{BillingPeriod, ConfirmationOutcome, IntentType, SyncOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to initiate a purchase
#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub course_id: Uuid,
    /// "one_time" or "monthly"
    pub pricing_type: String,
    #[serde(default)]
    pub trial_requested: bool,
    pub cohort_id: Option<Uuid>,
}

/// Response from initiating a purchase
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub client_secret: String,
    pub intent_type: IntentType,
    pub construct_id: String,
}

/// Request to confirm enrollment after client-side payment
#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub course_id: Uuid,
}

/// Request to cancel a subscription
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub course_id: Uuid,
}

/// Query params for the subscription endpoint
#[derive(Debug, Deserialize)]
pub struct SubscriptionQuery {
    pub course_id: Uuid,
}

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: String,
    pub subscription_type: String,
    pub trial_end: Option<String>,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub next_invoice_date: Option<String>,
    pub next_invoice_amount: Option<i64>,
    pub cancel_at_period_end: bool,
}

/// Initiate a one-time purchase or subscription for a course
pub async fn create_checkout(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let pricing_type = BillingPeriod::from_str(&req.pricing_type).ok_or_else(|| {
        ApiError::Validation(format!(
            "Unknown pricing type '{}'; expected one_time or monthly",
            req.pricing_type
        ))
    })?;

    let intent = state
        .billing
        .checkout
        .initiate(
            auth_user.user_id,
            req.course_id,
            pricing_type,
            req.trial_requested,
            req.cohort_id,
        )
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        course_id = %req.course_id,
        construct_id = %intent.construct_id,
        "Checkout initiated"
    );

    Ok(Json(CheckoutResponse {
        client_secret: intent.client_secret,
        intent_type: intent.intent_type,
        construct_id: intent.construct_id,
    }))
}

/// Confirm enrollment after the client believes payment succeeded
///
/// Blocks for a bounded number of seconds while the webhook races in; falls
/// back to one direct provider query. Pending outcomes return 202 so the
/// client can retry.
pub async fn confirm_enrollment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<ConfirmRequest>,
) -> Result<(StatusCode, Json<ConfirmationOutcome>), ApiError> {
    let outcome = state
        .billing
        .confirmation
        .confirm(auth_user.user_id, req.course_id)
        .await?;

    let status = match &outcome {
        ConfirmationOutcome::Enrolled { .. } => StatusCode::OK,
        ConfirmationOutcome::PaymentFailed { .. } => StatusCode::PAYMENT_REQUIRED,
        ConfirmationOutcome::Pending { .. } => StatusCode::ACCEPTED,
    };

    Ok((status, Json(outcome)))
}

/// Stripe webhook endpoint
///
/// Returns 200 on processed-or-duplicate so Stripe stops redelivering, and
/// an error status otherwise so its retry mechanism re-delivers.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    state.billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}

/// Get the current user's subscription for a course
pub async fn get_subscription(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<SubscriptionQuery>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let row = state
        .billing
        .subscriptions
        .get_open(auth_user.user_id, query.course_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No subscription for this course".to_string()))?;

    Ok(Json(SubscriptionInfo {
        status: row.status,
        subscription_type: row.subscription_type,
        trial_end: row.trial_end.map(|t| t.to_string()),
        current_period_start: row.current_period_start.map(|t| t.to_string()),
        current_period_end: row.current_period_end.map(|t| t.to_string()),
        next_invoice_date: row.next_invoice_date.map(|t| t.to_string()),
        next_invoice_amount: row.next_invoice_amount,
        cancel_at_period_end: row.cancel_at_period_end,
    }))
}

/// Payment history for the current user
pub async fn list_payments(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<Vec<campus_billing::PaymentRecord>>, ApiError> {
    let payments = state
        .billing
        .payments
        .list_for_user(auth_user.user_id, 50)
        .await?;

    Ok(Json(payments))
}

/// Cancel the current user's subscription for a course
pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CancelRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .billing
        .subscriptions
        .cancel_subscription(auth_user.user_id, req.course_id)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        course_id = %req.course_id,
        "Subscription cancellation requested"
    );

    Ok(StatusCode::OK)
}

/// Synchronize a course's billing configuration
///
/// Invoked by the catalog service as a post-commit hook after course
/// mutations, and by admins to force a re-sync. Always returns the
/// structured outcome; a sync failure must not fail the catalog's own
/// mutation, so provider errors are reported in the body rather than as an
/// error status.
pub async fn sync_course(
    State(state): State<AppState>,
    Path(course_id): Path<Uuid>,
) -> Result<Json<SyncReport>, ApiError> {
    match state.billing.sync.sync_course(course_id).await {
        Ok(outcome) => Ok(Json(SyncReport {
            ok: true,
            outcome: Some(outcome),
            error: None,
        })),
        Err(e) if e.is_retryable() => {
            // Recorded on the product row; the worker retries out-of-band.
            Ok(Json(SyncReport {
                ok: false,
                outcome: None,
                error: Some(e.to_string()),
            }))
        }
        Err(e) => Err(e.into()),
    }
}

/// Body of the sync endpoint response
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
