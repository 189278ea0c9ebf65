//! Stripe webhook handling.
//!
//! Events arrive at-least-once and possibly out of order. Correctness comes
//! from two layers: the idempotency ledger (`webhook_events`, claimed with an
//! atomic `INSERT ... ON CONFLICT ... RETURNING`) suppresses duplicate event
//! ids, and the handlers themselves are idempotent — create-if-absent side
//! effects and a status guard that never moves backward — so a replayed or
//! reordered event that slips past the ledger still cannot corrupt state.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    Event, EventObject, EventType, Invoice, PaymentIntent, SetupIntent,
    Subscription as StripeSubscription, Webhook,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::CatalogReader;
use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::payments::PaymentLedger;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (replay window).
const MAX_TIMESTAMP_AGE_SECS: i64 = 300;

/// Webhook handler for Stripe events.
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    subscriptions: SubscriptionService,
    ledger: PaymentLedger,
    catalog: CatalogReader,
    email: BillingEmailService,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone(), email.clone());
        let ledger = PaymentLedger::new(pool.clone());
        let catalog = CatalogReader::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            subscriptions,
            ledger,
            catalog,
            email,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the SDK's verification first, then falls back to manual
    /// signature verification for API versions the pinned SDK does not
    /// parse.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The `INSERT ... ON CONFLICT ... RETURNING` claim ensures only one
    /// concurrent delivery processes a given event id; events stuck in
    /// `processing` for over 30 minutes may be re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE webhook_events.processing_result = 'processing'
              AND webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            // Duplicate delivery: acknowledge without reprocessing.
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event - atomic idempotency check"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to update webhook ledger row; event may appear stuck in 'processing'"
            );
        }

        result
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_owned = event.clone();

        match event.type_ {
            // Subscription lifecycle: the event object is a snapshot, but the
            // apply path treats it as one observation of the remote state and
            // never regresses past what the local row already reached.
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event_owned)?;
                self.subscriptions
                    .apply_remote_subscription(&subscription, Some(&event_id), ActorType::Provider)
                    .await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event_owned)?;
                self.subscriptions
                    .apply_remote_subscription(&subscription, Some(&event_id), ActorType::Provider)
                    .await?;
            }
            EventType::CustomerSubscriptionTrialWillEnd => {
                let subscription = extract_subscription(event_owned)?;
                self.handle_trial_will_end(&subscription, &event_id).await?;
            }

            // Invoice outcomes drive trial conversion and past-due recovery.
            EventType::InvoicePaid => {
                let invoice = extract_invoice(event_owned)?;
                self.handle_invoice_paid(&invoice, &event_id).await?;
            }
            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event_owned)?;
                self.handle_invoice_payment_failed(&invoice, &event_id).await?;
            }

            // Payment-method-collected for trialing subscriptions.
            EventType::SetupIntentSucceeded => {
                let setup_intent = extract_setup_intent(event_owned)?;
                self.handle_setup_intent_succeeded(&setup_intent, &event_id)
                    .await?;
            }

            // One-time purchase settlement.
            EventType::PaymentIntentSucceeded => {
                let intent = extract_payment_intent(event_owned)?;
                self.handle_payment_intent_succeeded(&intent, &event_id)
                    .await?;
            }
            EventType::PaymentIntentPaymentFailed => {
                let intent = extract_payment_intent(event_owned)?;
                self.handle_payment_intent_failed(&intent, &event_id).await?;
            }

            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    async fn handle_invoice_paid(&self, invoice: &Invoice, event_id: &str) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();

        let Some(subscription_id) = invoice.subscription.as_ref().map(|s| s.id().to_string())
        else {
            tracing::info!(invoice_id = %invoice_id, "Invoice without subscription, ignoring");
            return Ok(());
        };

        // Re-derive state from the authoritative remote object rather than
        // the (possibly stale) event payload; this also creates the local
        // row if the webhook outran the initiator.
        let apply = self
            .subscriptions
            .resync_from_remote(&subscription_id, Some(event_id), ActorType::Provider)
            .await?;

        let row = self
            .subscriptions
            .get_by_remote_id(&subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} after resync", subscription_id))
            })?;

        let amount = invoice.amount_paid.unwrap_or(0);
        let charge_id = invoice.charge.as_ref().map(|c| c.id().to_string());

        let mut tx = self.pool.begin().await?;
        let inserted = self
            .ledger
            .record_invoice_paid_tx(
                &mut tx,
                row.user_id,
                Some(row.course_id),
                Some(row.id),
                &invoice_id,
                charge_id.as_deref(),
                amount,
            )
            .await?;
        tx.commit().await?;

        if inserted {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(BillingEventType::InvoicePaid)
                        .user(row.user_id)
                        .course(row.course_id)
                        .data(serde_json::json!({
                            "amount_paid": amount,
                            "status_after": apply.status.as_str(),
                        }))
                        .stripe_event(event_id)
                        .stripe_invoice(&invoice_id)
                        .stripe_subscription(subscription_id.clone())
                        .actor_type(ActorType::Provider),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log invoice paid event");
            }
        }

        tracing::info!(
            user_id = %row.user_id,
            invoice_id = %invoice_id,
            amount = amount,
            payment_recorded = inserted,
            "Invoice paid"
        );

        Ok(())
    }

    async fn handle_invoice_payment_failed(
        &self,
        invoice: &Invoice,
        event_id: &str,
    ) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();

        let Some(subscription_id) = invoice.subscription.as_ref().map(|s| s.id().to_string())
        else {
            tracing::info!(invoice_id = %invoice_id, "Failed invoice without subscription, ignoring");
            return Ok(());
        };

        // Remote status will read past_due; the apply path performs the
        // transition and surfaces it to the user.
        self.subscriptions
            .resync_from_remote(&subscription_id, Some(event_id), ActorType::Provider)
            .await?;

        let row = self
            .subscriptions
            .get_by_remote_id(&subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} after resync", subscription_id))
            })?;

        let amount = invoice.amount_due.unwrap_or(0);
        let attempt_count = invoice.attempt_count.unwrap_or(0);

        let mut tx = self.pool.begin().await?;
        self.ledger
            .record_invoice_failed_tx(
                &mut tx,
                row.user_id,
                Some(row.course_id),
                Some(row.id),
                &invoice_id,
                amount,
                Some("invoice payment failed"),
            )
            .await?;
        tx.commit().await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(BillingEventType::InvoiceFailed)
                    .user(row.user_id)
                    .course(row.course_id)
                    .data(serde_json::json!({
                        "amount_due": amount,
                        "attempt_count": attempt_count,
                    }))
                    .stripe_event(event_id)
                    .stripe_invoice(&invoice_id)
                    .stripe_subscription(subscription_id)
                    .actor_type(ActorType::Provider),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice failed event");
        }

        tracing::warn!(
            user_id = %row.user_id,
            invoice_id = %invoice_id,
            amount = amount,
            attempt_count = attempt_count,
            "Invoice payment failed"
        );

        Ok(())
    }

    /// Payment method collected: push the subscription out of `incomplete`.
    ///
    /// The setup intent only names the customer, so every incomplete
    /// subscription of that customer is resynced from its authoritative
    /// remote object.
    async fn handle_setup_intent_succeeded(
        &self,
        setup_intent: &SetupIntent,
        event_id: &str,
    ) -> BillingResult<()> {
        let Some(customer_id) = setup_intent.customer.as_ref().map(|c| c.id().to_string())
        else {
            tracing::info!(setup_intent = %setup_intent.id, "Setup intent without customer, ignoring");
            return Ok(());
        };

        let pending: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s.stripe_subscription_id
            FROM subscriptions s
            JOIN customer_accounts c ON c.user_id = s.user_id
            WHERE c.stripe_customer_id = $1
              AND s.status = 'incomplete'
              AND s.stripe_subscription_id IS NOT NULL
            "#,
        )
        .bind(&customer_id)
        .fetch_all(&self.pool)
        .await?;

        for (subscription_id,) in pending {
            if let Err(e) = self
                .subscriptions
                .resync_from_remote(&subscription_id, Some(event_id), ActorType::Provider)
                .await
            {
                tracing::error!(
                    stripe_subscription_id = %subscription_id,
                    error = %e,
                    "Failed to resync subscription after payment method collection"
                );
            }
        }

        Ok(())
    }

    async fn handle_payment_intent_succeeded(
        &self,
        intent: &PaymentIntent,
        event_id: &str,
    ) -> BillingResult<()> {
        let intent_id = intent.id.to_string();

        // Invoice-backed intents (subscription charges) are settled by the
        // invoice.paid handler.
        if intent.invoice.is_some() {
            return Ok(());
        }

        let charge_id = intent.latest_charge.as_ref().map(|c| c.id().to_string());

        match self
            .subscriptions
            .activate_one_time_purchase(&intent_id, charge_id.as_deref(), Some(event_id), ActorType::Provider)
            .await
        {
            Ok(_) => Ok(()),
            Err(BillingError::NotFound(_)) => {
                // Not a course purchase we know about; acknowledge anyway.
                tracing::warn!(
                    payment_intent = %intent_id,
                    "Payment intent succeeded with no matching purchase record"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_payment_intent_failed(
        &self,
        intent: &PaymentIntent,
        event_id: &str,
    ) -> BillingResult<()> {
        let intent_id = intent.id.to_string();

        if intent.invoice.is_some() {
            return Ok(());
        }

        let failure_reason = intent
            .last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| "payment failed".to_string());

        let mut tx = self.pool.begin().await?;
        let settled = self
            .ledger
            .settle_intent_tx(
                &mut tx,
                &intent_id,
                crate::payments::PAYMENT_FAILED,
                None,
                Some(&failure_reason),
            )
            .await?;
        tx.commit().await?;

        if !settled {
            // Already settled or not ours; nothing to do.
            return Ok(());
        }

        let record = self.ledger.get_by_intent(&intent_id).await?;
        if let Some(record) = record {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(BillingEventType::PaymentFailed)
                        .user(record.user_id)
                        .data(serde_json::json!({
                            "payment_intent": intent_id,
                            "reason": failure_reason,
                        }))
                        .stripe_event(event_id)
                        .actor_type(ActorType::Provider),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log payment failure event");
            }

            if let (Ok(email), Some(course_id)) = (
                self.catalog.get_user_email(record.user_id).await,
                record.course_id,
            ) {
                if let Ok(course) = self.catalog.get_course(course_id).await {
                    if let Err(e) = self
                        .email
                        .send_payment_failed(&email, &course.title, record.amount)
                        .await
                    {
                        tracing::error!(error = %e, "Failed to send payment failed email");
                    }
                }
            }
        }

        tracing::warn!(
            payment_intent = %intent_id,
            reason = %failure_reason,
            "One-time payment failed"
        );

        Ok(())
    }

    async fn handle_trial_will_end(
        &self,
        subscription: &StripeSubscription,
        event_id: &str,
    ) -> BillingResult<()> {
        let Some(row) = self
            .subscriptions
            .get_by_remote_id(subscription.id.as_str())
            .await?
        else {
            tracing::info!(
                stripe_subscription_id = %subscription.id,
                "Trial ending for unknown subscription, ignoring"
            );
            return Ok(());
        };

        let days_remaining = subscription
            .trial_end
            .map(|end| {
                let now = OffsetDateTime::now_utc().unix_timestamp();
                ((end - now) / 86_400).max(1)
            })
            .unwrap_or(3);

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(BillingEventType::TrialEnding)
                    .user(row.user_id)
                    .course(row.course_id)
                    .data(serde_json::json!({ "days_remaining": days_remaining }))
                    .stripe_event(event_id)
                    .stripe_subscription(subscription.id.to_string())
                    .actor_type(ActorType::Provider),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log trial ending event");
        }

        let email = self.catalog.get_user_email(row.user_id).await?;
        let course = self.catalog.get_course(row.course_id).await?;
        if let Err(e) = self
            .email
            .send_trial_ending(&email, &course.title, days_remaining)
            .await
        {
            tracing::error!(error = %e, "Failed to send trial ending email");
        }

        Ok(())
    }

    /// Replay a webhook event by fetching it from Stripe and re-processing.
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        let existing: Option<(Uuid, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, processing_result, error_message
            FROM webhook_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (record_id, previous_status, previous_error) = existing.ok_or_else(|| {
            BillingError::NotFound(format!("Webhook event {} not found", stripe_event_id))
        })?;

        let event_id = stripe_event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid event id: {}", e)))?;

        let event = Event::retrieve(self.stripe.inner(), &event_id, &[])
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to fetch event: {}", e)))?;

        let process_result = self.process_event_internal(&event).await;

        let (new_status, new_error) = match &process_result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&new_status)
        .bind(&new_error)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id,
            stripe_event_id: stripe_event_id.to_string(),
            previous_status,
            previous_error,
            new_status,
            new_error,
            success: process_result.is_ok(),
        })
    }

    /// Replay all failed webhooks, oldest first; called by the worker.
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(100);

        let failed_events: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT stripe_event_id
            FROM webhook_events
            WHERE processing_result = 'error'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(failed_events.len());

        for (event_id,) in failed_events {
            match self.replay_webhook(&event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                }
            }
        }

        Ok(results)
    }
}

/// Result of a webhook replay operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

fn extract_subscription(event: Event) -> BillingResult<StripeSubscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn extract_payment_intent(event: Event) -> BillingResult<PaymentIntent> {
    match event.data.object {
        EventObject::PaymentIntent(intent) => Ok(intent),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected PaymentIntent".to_string(),
        )),
    }
}

fn extract_setup_intent(event: Event) -> BillingResult<SetupIntent> {
    match event.data.object {
        EventObject::SetupIntent(intent) => Ok(intent),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected SetupIntent".to_string(),
        )),
    }
}

/// Manual signature verification: `t=<ts>,v1=<hmac-sha256 hex>` over
/// `"{t}.{payload}"` with the endpoint secret.
fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > MAX_TIMESTAMP_AGE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    const SECRET: &str = "whsec_test_secret_key";
    const PAYLOAD: &str = r#"{"id":"evt_123","type":"invoice.paid"}"#;

    #[test]
    fn test_valid_signature_accepted() {
        let now = 1_700_000_000;
        let header = sign(PAYLOAD, SECRET, now);
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = sign(PAYLOAD, SECRET, now);
        let tampered = r#"{"id":"evt_999","type":"invoice.paid"}"#;
        assert!(matches!(
            verify_signature(tampered, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let header = sign(PAYLOAD, "whsec_other_secret", now);
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signed_at = 1_700_000_000;
        let header = sign(PAYLOAD, SECRET, signed_at);
        // Delivered 6 minutes later: outside the replay window.
        assert!(verify_signature(PAYLOAD, &header, SECRET, signed_at + 360).is_err());
        // 4 minutes is within tolerance.
        assert!(verify_signature(PAYLOAD, &header, SECRET, signed_at + 240).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let now = 1_700_000_000;
        assert!(verify_signature(PAYLOAD, "", SECRET, now).is_err());
        assert!(verify_signature(PAYLOAD, "v1=abcdef", SECRET, now).is_err());
        assert!(verify_signature(PAYLOAD, "t=1700000000", SECRET, now).is_err());
    }
}
