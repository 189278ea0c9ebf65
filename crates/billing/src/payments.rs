//! Payment ledger.
//!
//! One row per charge outcome. Rows keyed by a remote invoice or payment
//! intent id are unique, so redelivered events cannot duplicate them. A
//! `pending` placeholder (written by the initiator) settles exactly once;
//! settled rows are never touched again.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Outcome states of a ledger row.
pub const PAYMENT_PENDING: &str = "pending";
pub const PAYMENT_SUCCEEDED: &str = "succeeded";
pub const PAYMENT_FAILED: &str = "failed";

/// Payment history row.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Append-only payment ledger.
#[derive(Clone)]
pub struct PaymentLedger {
    pool: PgPool,
}

impl PaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a pending placeholder for a one-time purchase. Written before
    /// the client secret is returned so later events can be matched back.
    pub async fn insert_pending_intent(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        stripe_payment_intent_id: &str,
        amount: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, course_id, stripe_payment_intent_id, amount, currency, status)
            VALUES ($1, $2, $3, $4, 'usd', 'pending')
            ON CONFLICT (stripe_payment_intent_id) WHERE stripe_payment_intent_id IS NOT NULL
            DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(stripe_payment_intent_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Settle a pending one-time charge. The `status = 'pending'` guard makes
    /// settlement first-writer-wins between the webhook and the poller.
    pub async fn settle_intent_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stripe_payment_intent_id: &str,
        status: &str,
        charge_id: Option<&str>,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, stripe_charge_id = $3, failure_reason = $4, updated_at = NOW()
            WHERE stripe_payment_intent_id = $1 AND status = 'pending'
            "#,
        )
        .bind(stripe_payment_intent_id)
        .bind(status)
        .bind(charge_id)
        .bind(failure_reason)
        .execute(&mut **tx)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    /// Record a paid subscription invoice. Duplicate deliveries collapse on
    /// the unique invoice index: exactly one row per invoice.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_invoice_paid_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        course_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
        stripe_invoice_id: &str,
        stripe_charge_id: Option<&str>,
        amount: i64,
    ) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, course_id, subscription_id, stripe_invoice_id, stripe_charge_id,
                 amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'usd', 'succeeded')
            ON CONFLICT (stripe_invoice_id) WHERE stripe_invoice_id IS NOT NULL
            DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(subscription_id)
        .bind(stripe_invoice_id)
        .bind(stripe_charge_id)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    /// Record a failed subscription invoice attempt.
    pub async fn record_invoice_failed_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        course_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
        stripe_invoice_id: &str,
        amount: i64,
        failure_reason: Option<&str>,
    ) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, course_id, subscription_id, stripe_invoice_id,
                 amount, currency, status, failure_reason)
            VALUES ($1, $2, $3, $4, $5, 'usd', 'failed', $6)
            ON CONFLICT (stripe_invoice_id) WHERE stripe_invoice_id IS NOT NULL
            DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(subscription_id)
        .bind(stripe_invoice_id)
        .bind(amount)
        .bind(failure_reason)
        .execute(&mut **tx)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    pub async fn get_by_intent(
        &self,
        stripe_payment_intent_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, course_id, subscription_id, stripe_payment_intent_id,
                   stripe_invoice_id, stripe_charge_id, amount, currency, status,
                   failure_reason, created_at
            FROM payments
            WHERE stripe_payment_intent_id = $1
            "#,
        )
        .bind(stripe_payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Payment history for a user, newest first.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let rows: Vec<PaymentRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, course_id, subscription_id, stripe_payment_intent_id,
                   stripe_invoice_id, stripe_charge_id, amount, currency, status,
                   failure_reason, created_at
            FROM payments
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
