//! HTTP route definitions.

pub mod billing;
pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/billing/checkout", post(billing::create_checkout))
        .route("/api/billing/confirm", post(billing::confirm_enrollment))
        .route("/api/billing/webhook", post(billing::webhook))
        .route("/api/billing/subscription", get(billing::get_subscription))
        .route("/api/billing/payments", get(billing::list_payments))
        .route("/api/billing/cancel", post(billing::cancel_subscription))
        .route("/api/billing/sync/{course_id}", post(billing::sync_course))
        .with_state(state)
}
