//! Billing audit events.
//!
//! Every mutation the engine performs is recorded in `billing_events` with
//! the remote correlation ids that drove it. Logging failures are warned
//! about by callers and never abort the mutation itself.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who triggered a billing mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// Internal logic (sync hooks, state machine).
    System,
    /// A verified provider webhook.
    Provider,
    /// A user-initiated request.
    User,
    /// The background worker.
    Worker,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::Provider => "provider",
            ActorType::User => "user",
            ActorType::Worker => "worker",
        }
    }
}

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    ProductSynced,
    PricesReplaced,
    SubscriptionCreated,
    SubscriptionStatusChanged,
    SubscriptionCanceled,
    InvoicePaid,
    InvoiceFailed,
    PaymentSucceeded,
    PaymentFailed,
    EnrollmentGranted,
    EnrollmentRevoked,
    TrialEnding,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::ProductSynced => "product_synced",
            BillingEventType::PricesReplaced => "prices_replaced",
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionStatusChanged => "subscription_status_changed",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::InvoicePaid => "invoice_paid",
            BillingEventType::InvoiceFailed => "invoice_failed",
            BillingEventType::PaymentSucceeded => "payment_succeeded",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::EnrollmentGranted => "enrollment_granted",
            BillingEventType::EnrollmentRevoked => "enrollment_revoked",
            BillingEventType::TrialEnding => "trial_ending",
        }
    }
}

/// Builder for one audit event row.
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    event_type: BillingEventType,
    user_id: Option<Uuid>,
    course_id: Option<Uuid>,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_invoice_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(event_type: BillingEventType) -> Self {
        Self {
            event_type,
            user_id: None,
            course_id: None,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_invoice_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn course(mut self, course_id: Uuid) -> Self {
        self.course_id = Some(course_id);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: &str) -> Self {
        self.stripe_event_id = Some(event_id.to_string());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn stripe_invoice(mut self, invoice_id: &str) -> Self {
        self.stripe_invoice_id = Some(invoice_id.to_string());
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }
}

/// Writer for the billing audit trail.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (user_id, course_id, event_type, data,
                 stripe_event_id, stripe_subscription_id, stripe_invoice_id, actor_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.course_id)
        .bind(builder.event_type.as_str())
        .bind(&builder.data)
        .bind(builder.stripe_event_id.as_deref())
        .bind(builder.stripe_subscription_id.as_deref())
        .bind(builder.stripe_invoice_id.as_deref())
        .bind(builder.actor_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_fields() {
        let user_id = Uuid::new_v4();
        let builder = BillingEventBuilder::new(BillingEventType::InvoicePaid)
            .user(user_id)
            .stripe_event("evt_123")
            .stripe_invoice("in_456")
            .actor_type(ActorType::Provider);

        assert_eq!(builder.user_id, Some(user_id));
        assert_eq!(builder.stripe_event_id.as_deref(), Some("evt_123"));
        assert_eq!(builder.stripe_invoice_id.as_deref(), Some("in_456"));
        assert_eq!(builder.actor_type, ActorType::Provider);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(BillingEventType::PricesReplaced.as_str(), "prices_replaced");
        assert_eq!(
            BillingEventType::SubscriptionStatusChanged.as_str(),
            "subscription_status_changed"
        );
        assert_eq!(ActorType::Worker.as_str(), "worker");
    }
}
