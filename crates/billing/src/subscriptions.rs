//! Subscription state machine and persistence.
//!
//! All subscription mutations flow through `apply_remote_subscription` (for
//! recurring constructs) or `activate_one_time_purchase` (for one-time
//! purchases). Both the webhook processor and the confirmation poller call
//! these same functions, so the push and pull paths race safely:
//! first writer wins, the rest are no-ops.
//!
//! Status only moves forward. When an event references a state the local row
//! has already surpassed, the status is kept and only the period/invoice
//! fields are resynced from the authoritative remote object.

use sqlx::{PgPool, Postgres, Transaction};
use stripe::{
    CancelSubscription, Subscription as StripeSubscription,
    SubscriptionStatus as StripeSubStatus,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::CatalogReader;
use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::enrollment::EnrollmentService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::payments::PaymentLedger;

/// Local subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// Whether the user currently has (or is earning) access.
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Trialing | SubscriptionStatus::Active)
    }

    /// Valid forward transitions.
    ///
    /// `canceled` is reachable from every non-terminal state; `past_due`
    /// recovers to `active` on a later paid invoice; nothing ever returns
    /// to `incomplete`.
    pub fn can_transition(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, to) {
            (Incomplete, Trialing) | (Incomplete, Active) => true,
            (Trialing, Active) | (Trialing, PastDue) => true,
            (Active, PastDue) => true,
            (PastDue, Active) => true,
            (Canceled, _) => false,
            (_, Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the purchase is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Trial,
    Monthly,
    OneTime,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Trial => "trial",
            SubscriptionType::Monthly => "monthly",
            SubscriptionType::OneTime => "one_time",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trial" => Some(SubscriptionType::Trial),
            "monthly" => Some(SubscriptionType::Monthly),
            "one_time" => Some(SubscriptionType::OneTime),
            _ => None,
        }
    }
}

/// Map the provider's subscription status onto the local machine.
///
/// `unpaid` (retries exhausted) and `paused` keep the grace-period
/// semantics of `past_due`; `incomplete_expired` is terminal.
pub fn map_remote_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid | StripeSubStatus::Paused => {
            SubscriptionStatus::PastDue
        }
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
    }
}

/// Resolve the status a row should take given an observed remote state.
///
/// Returns the new status and whether it changed. An observation the row
/// has already surpassed resolves to the current status: fields are still
/// resynced, but status never moves backward.
pub fn resolve_status(
    current: SubscriptionStatus,
    target: SubscriptionStatus,
) -> (SubscriptionStatus, bool) {
    if current == target {
        (current, false)
    } else if current.can_transition(target) {
        (target, true)
    } else {
        (current, false)
    }
}

/// Local subscription row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub cohort_id: Option<Uuid>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_payment_intent_id: Option<String>,
    pub status: String,
    pub subscription_type: String,
    pub trial_end: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub next_invoice_date: Option<OffsetDateTime>,
    pub next_invoice_amount: Option<i64>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub enrollment_granted_at: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    pub fn status_enum(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_str(&self.status).unwrap_or(SubscriptionStatus::Incomplete)
    }
}

/// Result of applying a remote state to the local row.
#[derive(Debug, Clone, Copy)]
pub struct ApplyResult {
    pub status: SubscriptionStatus,
    pub status_changed: bool,
    pub enrollment_granted: bool,
}

const SELECT_COLUMNS: &str = r#"
    id, user_id, course_id, cohort_id, stripe_subscription_id, stripe_payment_intent_id,
    status, subscription_type, trial_end, current_period_start, current_period_end,
    next_invoice_date, next_invoice_amount, cancel_at_period_end, canceled_at,
    enrollment_granted_at
"#;

/// Subscription service.
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    catalog: CatalogReader,
    enrollment: EnrollmentService,
    ledger: PaymentLedger,
    email: BillingEmailService,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            stripe,
            catalog: CatalogReader::new(pool.clone()),
            enrollment: EnrollmentService::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool.clone()),
            email,
            pool,
        }
    }

    /// Insert the local placeholder row at initiation time, before the
    /// client secret is returned to the caller.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_placeholder(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        cohort_id: Option<Uuid>,
        subscription_type: SubscriptionType,
        stripe_subscription_id: Option<&str>,
        stripe_payment_intent_id: Option<&str>,
        trial_end: Option<OffsetDateTime>,
    ) -> BillingResult<Uuid> {
        // The webhook for the freshly created construct can land before this
        // insert commits; in that case the processor already created the row
        // and we adopt it instead of failing.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, course_id, cohort_id, stripe_subscription_id,
                 stripe_payment_intent_id, status, subscription_type, trial_end)
            VALUES ($1, $2, $3, $4, $5, 'incomplete', $6, $7)
            ON CONFLICT (user_id, course_id) WHERE status != 'canceled'
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(cohort_id)
        .bind(stripe_subscription_id)
        .bind(stripe_payment_intent_id)
        .bind(subscription_type.as_str())
        .bind(trial_end)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(id);
        }

        let existing = self.get_open(user_id, course_id).await?;
        match existing {
            Some(row)
                if row.stripe_subscription_id.as_deref() == stripe_subscription_id
                    || row.stripe_payment_intent_id.as_deref() == stripe_payment_intent_id =>
            {
                Ok(row.id)
            }
            Some(_) => Err(BillingError::PurchaseAlreadyOpen),
            None => Err(BillingError::Internal(
                "placeholder insert conflicted but no open row found".to_string(),
            )),
        }
    }

    /// Apply the authoritative remote subscription state to the local row.
    ///
    /// Idempotent and safe to race: the row is locked for the duration of
    /// the transaction, the status guard never moves backward, and the
    /// enrollment side effect is create-if-absent gated by
    /// `enrollment_granted_at`.
    pub async fn apply_remote_subscription(
        &self,
        remote: &StripeSubscription,
        event_id: Option<&str>,
        actor: ActorType,
    ) -> BillingResult<ApplyResult> {
        let remote_id = remote.id.to_string();
        let target = map_remote_status(remote.status);

        let mut tx = self.pool.begin().await?;

        let row = self.lock_by_remote_id(&mut tx, &remote_id).await?;
        let row = match row {
            Some(row) => row,
            None => self.insert_from_remote(&mut tx, remote).await?,
        };

        let current = row.status_enum();

        // Payment-method-collected gate: a trial subscription reads
        // `trialing` remotely from the moment it is created, but access is
        // only earned once a payment method is on file. The setup intent
        // completion saves the method onto the subscription, after which the
        // next observation passes this gate.
        let target = if current == SubscriptionStatus::Incomplete
            && target == SubscriptionStatus::Trialing
            && remote.default_payment_method.is_none()
        {
            SubscriptionStatus::Incomplete
        } else {
            target
        };

        let (new_status, status_changed) = resolve_status(current, target);
        if !status_changed && current != target {
            tracing::warn!(
                subscription_id = %row.id,
                stripe_subscription_id = %remote_id,
                local_status = %current,
                remote_status = %target,
                "Remote state behind local row; keeping status and resyncing fields"
            );
        }

        // Period and invoice fields always come from the remote object, never
        // from local arithmetic or possibly-stale event payloads.
        let period_start = OffsetDateTime::from_unix_timestamp(remote.current_period_start).ok();
        let period_end = OffsetDateTime::from_unix_timestamp(remote.current_period_end).ok();
        let trial_end = remote
            .trial_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());
        let canceled_at = remote
            .canceled_at
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

        let plan_amount = remote
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.unit_amount);

        let (next_invoice_date, next_invoice_amount) = match new_status {
            SubscriptionStatus::Trialing => (trial_end, plan_amount),
            SubscriptionStatus::Active | SubscriptionStatus::PastDue => (period_end, plan_amount),
            _ => (None, None),
        };

        let mut subscription_type =
            SubscriptionType::from_str(&row.subscription_type).unwrap_or(SubscriptionType::Monthly);
        if new_status == SubscriptionStatus::Active && subscription_type == SubscriptionType::Trial {
            subscription_type = SubscriptionType::Monthly;
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, subscription_type = $3, trial_end = $4,
                current_period_start = $5, current_period_end = $6,
                next_invoice_date = $7, next_invoice_amount = $8,
                cancel_at_period_end = $9, canceled_at = $10, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(new_status.as_str())
        .bind(subscription_type.as_str())
        .bind(trial_end)
        .bind(period_start)
        .bind(period_end)
        .bind(next_invoice_date)
        .bind(next_invoice_amount)
        .bind(remote.cancel_at_period_end)
        .bind(canceled_at)
        .execute(&mut *tx)
        .await?;

        let mut enrollment_granted = false;
        if new_status.grants_access() && row.enrollment_granted_at.is_none() {
            self.enrollment
                .ensure_enrollment_tx(&mut tx, row.user_id, row.course_id, new_status.as_str())
                .await?;
            sqlx::query("UPDATE subscriptions SET enrollment_granted_at = NOW() WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
            enrollment_granted = true;
        }

        if status_changed && new_status == SubscriptionStatus::Canceled {
            // Access is revoked at period end, not immediately.
            let revoke_at = period_end.unwrap_or_else(OffsetDateTime::now_utc);
            self.enrollment
                .schedule_revocation_tx(&mut tx, row.user_id, row.course_id, revoke_at)
                .await?;
        }

        tx.commit().await?;

        if status_changed {
            self.report_transition(&row, current, new_status, &remote_id, event_id, actor)
                .await;
        }

        Ok(ApplyResult {
            status: new_status,
            status_changed,
            enrollment_granted,
        })
    }

    /// Settle a one-time purchase: ledger row to `succeeded`, access record
    /// to `active`, enrollment granted. Both the webhook and the poller call
    /// this; the pending-guard and status guard make the second caller a
    /// no-op.
    pub async fn activate_one_time_purchase(
        &self,
        payment_intent_id: &str,
        charge_id: Option<&str>,
        event_id: Option<&str>,
        actor: ActorType,
    ) -> BillingResult<ApplyResult> {
        let mut tx = self.pool.begin().await?;

        let row = self.lock_by_payment_intent(&mut tx, payment_intent_id).await?;
        let row = row.ok_or_else(|| {
            BillingError::NotFound(format!(
                "No purchase record for payment intent {}",
                payment_intent_id
            ))
        })?;

        self.ledger
            .settle_intent_tx(
                &mut tx,
                payment_intent_id,
                crate::payments::PAYMENT_SUCCEEDED,
                charge_id,
                None,
            )
            .await?;

        let current = row.status_enum();
        if !current.can_transition(SubscriptionStatus::Active) {
            // Already active (or canceled): nothing further to apply.
            tx.commit().await?;
            return Ok(ApplyResult {
                status: current,
                status_changed: false,
                enrollment_granted: false,
            });
        }

        sqlx::query("UPDATE subscriptions SET status = 'active', updated_at = NOW() WHERE id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        let mut enrollment_granted = false;
        if row.enrollment_granted_at.is_none() {
            self.enrollment
                .ensure_enrollment_tx(&mut tx, row.user_id, row.course_id, "active")
                .await?;
            sqlx::query("UPDATE subscriptions SET enrollment_granted_at = NOW() WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
            enrollment_granted = true;
        }

        tx.commit().await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(BillingEventType::PaymentSucceeded)
                    .user(row.user_id)
                    .course(row.course_id)
                    .data(serde_json::json!({
                        "payment_intent": payment_intent_id,
                        "enrollment_granted": enrollment_granted,
                    }))
                    .stripe_event(event_id.unwrap_or_default())
                    .actor_type(actor),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log one-time purchase event");
        }

        tracing::info!(
            user_id = %row.user_id,
            course_id = %row.course_id,
            payment_intent = %payment_intent_id,
            "One-time purchase settled"
        );

        Ok(ApplyResult {
            status: SubscriptionStatus::Active,
            status_changed: true,
            enrollment_granted,
        })
    }

    /// Explicit cancellation request. Cancels the remote construct and
    /// applies the resulting state through the standard path.
    pub async fn cancel_subscription(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> BillingResult<ApplyResult> {
        let row = self
            .get_open(user_id, course_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("No open subscription".to_string()))?;

        let remote_id = row.stripe_subscription_id.as_deref().ok_or_else(|| {
            BillingError::InvalidInput(
                "One-time purchases cannot be cancelled through billing".to_string(),
            )
        })?;

        let sub_id = remote_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {}", e)))?;

        let canceled =
            StripeSubscription::cancel(self.stripe.inner(), &sub_id, CancelSubscription::default())
                .await?;

        self.apply_remote_subscription(&canceled, None, ActorType::User)
            .await
    }

    /// Fetch the authoritative remote object and apply it; used by the
    /// confirmation poller's fallback and by invoice handlers that only
    /// carry a subscription id.
    pub async fn resync_from_remote(
        &self,
        stripe_subscription_id: &str,
        event_id: Option<&str>,
        actor: ActorType,
    ) -> BillingResult<ApplyResult> {
        let sub_id = stripe_subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {}", e)))?;

        let remote = StripeSubscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        self.apply_remote_subscription(&remote, event_id, actor).await
    }

    pub async fn get_open(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND course_id = $2 AND status != 'canceled'"
        );
        let row: Option<SubscriptionRecord> = sqlx::query_as(&query)
            .bind(user_id)
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    pub async fn get_by_remote_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query =
            format!("SELECT {SELECT_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1");
        let row: Option<SubscriptionRecord> = sqlx::query_as(&query)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn lock_by_remote_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions \
             WHERE stripe_subscription_id = $1 FOR UPDATE"
        );
        let row: Option<SubscriptionRecord> = sqlx::query_as(&query)
            .bind(stripe_subscription_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row)
    }

    async fn lock_by_payment_intent(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_intent_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions \
             WHERE stripe_payment_intent_id = $1 FOR UPDATE"
        );
        let row: Option<SubscriptionRecord> = sqlx::query_as(&query)
            .bind(payment_intent_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row)
    }

    /// Create the local row from remote metadata when a webhook outruns the
    /// initiator's placeholder insert.
    async fn insert_from_remote(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        remote: &StripeSubscription,
    ) -> BillingResult<SubscriptionRecord> {
        let user_id = metadata_uuid(&remote.metadata, "user_id").ok_or_else(|| {
            BillingError::Internal(format!(
                "Subscription {} has no user_id metadata and no local row",
                remote.id
            ))
        })?;
        let course_id = metadata_uuid(&remote.metadata, "course_id").ok_or_else(|| {
            BillingError::Internal(format!(
                "Subscription {} has no course_id metadata and no local row",
                remote.id
            ))
        })?;
        let cohort_id = metadata_uuid(&remote.metadata, "cohort_id");

        let subscription_type = if remote.trial_end.is_some() {
            SubscriptionType::Trial
        } else {
            SubscriptionType::Monthly
        };

        let query = format!(
            "INSERT INTO subscriptions \
                 (user_id, course_id, cohort_id, stripe_subscription_id, status, subscription_type) \
             VALUES ($1, $2, $3, $4, 'incomplete', $5) \
             RETURNING {SELECT_COLUMNS}"
        );
        let row: SubscriptionRecord = sqlx::query_as(&query)
            .bind(user_id)
            .bind(course_id)
            .bind(cohort_id)
            .bind(remote.id.as_str())
            .bind(subscription_type.as_str())
            .fetch_one(&mut **tx)
            .await?;

        tracing::info!(
            stripe_subscription_id = %remote.id,
            user_id = %user_id,
            course_id = %course_id,
            "Webhook arrived before placeholder; created local row from metadata"
        );

        Ok(row)
    }

    async fn report_transition(
        &self,
        row: &SubscriptionRecord,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        remote_id: &str,
        event_id: Option<&str>,
        actor: ActorType,
    ) {
        let event_type = match to {
            SubscriptionStatus::Canceled => BillingEventType::SubscriptionCanceled,
            _ => BillingEventType::SubscriptionStatusChanged,
        };

        let mut builder = BillingEventBuilder::new(event_type)
            .user(row.user_id)
            .course(row.course_id)
            .data(serde_json::json!({
                "from": from.as_str(),
                "to": to.as_str(),
            }))
            .stripe_subscription(remote_id)
            .actor_type(actor);
        if let Some(event_id) = event_id {
            builder = builder.stripe_event(event_id);
        }

        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log subscription transition");
        }

        tracing::info!(
            user_id = %row.user_id,
            course_id = %row.course_id,
            from = %from,
            to = %to,
            "Subscription transition applied"
        );

        // Past-due and cancellation are surfaced to the user; notification
        // failures never fail the transition.
        let notification: Option<
            std::pin::Pin<Box<dyn std::future::Future<Output = BillingResult<()>> + Send + '_>>,
        > = match to {
            SubscriptionStatus::PastDue => Some(Box::pin(self.notify_past_due(row))),
            SubscriptionStatus::Canceled => Some(Box::pin(self.notify_cancelled(row))),
            _ => None,
        };
        if let Some(fut) = notification {
            if let Err(e) = fut.await {
                tracing::error!(user_id = %row.user_id, error = %e, "Failed to send billing notification");
            }
        }
    }

    async fn notify_past_due(&self, row: &SubscriptionRecord) -> BillingResult<()> {
        let email = self.catalog.get_user_email(row.user_id).await?;
        let course = self.catalog.get_course(row.course_id).await?;
        self.email.send_subscription_past_due(&email, &course.title).await
    }

    async fn notify_cancelled(&self, row: &SubscriptionRecord) -> BillingResult<()> {
        let email = self.catalog.get_user_email(row.user_id).await?;
        let course = self.catalog.get_course(row.course_id).await?;
        let access_until = row
            .current_period_end
            .map(|t| t.date().to_string())
            .unwrap_or_else(|| "the end of the current period".to_string());
        self.email
            .send_subscription_cancelled(&email, &course.title, &access_until)
            .await
    }
}

fn metadata_uuid(
    metadata: &std::collections::HashMap<String, String>,
    key: &str,
) -> Option<Uuid> {
    metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Transition table
    // =========================================================================

    #[test]
    fn test_incomplete_enters_trial_or_active() {
        assert!(SubscriptionStatus::Incomplete.can_transition(SubscriptionStatus::Trialing));
        assert!(SubscriptionStatus::Incomplete.can_transition(SubscriptionStatus::Active));
        assert!(!SubscriptionStatus::Incomplete.can_transition(SubscriptionStatus::PastDue));
    }

    #[test]
    fn test_trial_converts_to_active() {
        assert!(SubscriptionStatus::Trialing.can_transition(SubscriptionStatus::Active));
        assert!(!SubscriptionStatus::Active.can_transition(SubscriptionStatus::Trialing));
    }

    #[test]
    fn test_past_due_is_recoverable() {
        assert!(SubscriptionStatus::Active.can_transition(SubscriptionStatus::PastDue));
        assert!(SubscriptionStatus::PastDue.can_transition(SubscriptionStatus::Active));
    }

    #[test]
    fn test_canceled_is_terminal_and_reachable_from_all() {
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
        ] {
            assert!(status.can_transition(SubscriptionStatus::Canceled));
        }
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert!(!SubscriptionStatus::Canceled.can_transition(status));
        }
    }

    #[test]
    fn test_nothing_returns_to_incomplete() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert!(!status.can_transition(SubscriptionStatus::Incomplete));
        }
    }

    #[test]
    fn test_access_states() {
        assert!(SubscriptionStatus::Trialing.grants_access());
        assert!(SubscriptionStatus::Active.grants_access());
        assert!(!SubscriptionStatus::Incomplete.grants_access());
        // Grace period: past_due keeps existing enrollment but does not
        // grant a new one.
        assert!(!SubscriptionStatus::PastDue.grants_access());
    }

    #[test]
    fn test_terminal_status() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    // =========================================================================
    // Remote status mapping
    // =========================================================================

    #[test]
    fn test_remote_status_mapping() {
        assert_eq!(
            map_remote_status(StripeSubStatus::Trialing),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            map_remote_status(StripeSubStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_remote_status(StripeSubStatus::Unpaid),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_remote_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(SubscriptionStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::from_str("unpaid"), None);
    }

    #[test]
    fn test_subscription_type_round_trip() {
        for ty in [
            SubscriptionType::Trial,
            SubscriptionType::Monthly,
            SubscriptionType::OneTime,
        ] {
            assert_eq!(SubscriptionType::from_str(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn test_metadata_uuid_parsing() {
        let id = Uuid::new_v4();
        let metadata = std::collections::HashMap::from([
            ("user_id".to_string(), id.to_string()),
            ("course_id".to_string(), "not-a-uuid".to_string()),
        ]);
        assert_eq!(metadata_uuid(&metadata, "user_id"), Some(id));
        assert_eq!(metadata_uuid(&metadata, "course_id"), None);
        assert_eq!(metadata_uuid(&metadata, "cohort_id"), None);
    }
}
