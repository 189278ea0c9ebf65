//! Enrollment confirmation polling.
//!
//! Called synchronously by the client right after it believes payment
//! succeeded, bridging the gap until the webhook lands. The poller watches
//! the local placeholder row for a bounded time; if the webhook has not
//! arrived by the deadline it queries the provider once for the
//! authoritative status and, on success, applies the same idempotent
//! transition the webhook would have. First writer wins; the delayed
//! webhook becomes a no-op.

use stripe::{PaymentIntent, PaymentIntentStatus};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::enrollment::{EnrollmentDetails, EnrollmentService};
use crate::error::{BillingError, BillingResult};
use crate::events::ActorType;
use crate::payments::{PaymentLedger, PAYMENT_FAILED};
use crate::subscriptions::{SubscriptionRecord, SubscriptionService};

/// Structured outcome of a confirmation attempt.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    /// Payment confirmed and enrollment granted.
    Enrolled {
        enrollment: EnrollmentDetails,
        status: String,
        subscription_type: String,
    },
    /// The payment definitively failed; the reason is user-presentable.
    PaymentFailed { reason: String },
    /// Neither success nor failure within the bound. The client should
    /// retry later; the webhook will finish the job.
    Pending { checked_provider: bool },
}

/// Confirmation poller.
pub struct ConfirmationService {
    stripe: StripeClient,
    subscriptions: SubscriptionService,
    enrollment: EnrollmentService,
    ledger: PaymentLedger,
}

impl ConfirmationService {
    pub fn new(
        stripe: StripeClient,
        pool: sqlx::PgPool,
        email: crate::email::BillingEmailService,
    ) -> Self {
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone(), email);
        let enrollment = EnrollmentService::new(pool.clone());
        let ledger = PaymentLedger::new(pool);
        Self {
            stripe,
            subscriptions,
            enrollment,
            ledger,
        }
    }

    /// Wait for the purchase to settle, bounded by the configured deadline.
    ///
    /// Never blocks past `poll_deadline` + `provider_query_timeout`, and is
    /// safe to race against the webhook processor working on the same row.
    pub async fn confirm(&self, user_id: Uuid, course_id: Uuid) -> BillingResult<ConfirmationOutcome> {
        let config = &self.stripe.config().confirmation;
        let deadline = Instant::now() + config.poll_deadline;

        let row = self
            .subscriptions
            .get_open(user_id, course_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("No purchase to confirm".to_string()))?;

        loop {
            if let Some(outcome) = self.check_local(&row, user_id, course_id).await? {
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(config.poll_interval.min(deadline - now)).await;
        }

        tracing::info!(
            user_id = %user_id,
            course_id = %course_id,
            "Local poll deadline reached, querying provider directly"
        );

        let fallback = timeout(
            config.provider_query_timeout,
            self.query_provider_and_apply(&row),
        )
        .await;

        match fallback {
            Ok(Ok(Some(outcome))) => Ok(outcome),
            Ok(Ok(None)) => Ok(ConfirmationOutcome::Pending {
                checked_provider: true,
            }),
            Ok(Err(e)) => {
                tracing::error!(
                    user_id = %user_id,
                    course_id = %course_id,
                    error = %e,
                    "Provider fallback query failed"
                );
                Ok(ConfirmationOutcome::Pending {
                    checked_provider: true,
                })
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    course_id = %course_id,
                    "Provider fallback query timed out"
                );
                Ok(ConfirmationOutcome::Pending {
                    checked_provider: false,
                })
            }
        }
    }

    /// One local check: has the webhook already settled this purchase?
    async fn check_local(
        &self,
        row: &SubscriptionRecord,
        user_id: Uuid,
        course_id: Uuid,
    ) -> BillingResult<Option<ConfirmationOutcome>> {
        let current = self
            .subscriptions
            .get_open(user_id, course_id)
            .await?;

        let Some(current) = current else {
            // The only way an open row disappears is cancellation.
            return Ok(Some(ConfirmationOutcome::PaymentFailed {
                reason: "purchase was canceled".to_string(),
            }));
        };

        if current.status_enum().grants_access() {
            return self.enrolled_outcome(&current).await.map(Some);
        }

        // One-time purchases can fail definitively while the row stays
        // incomplete; the ledger carries the outcome.
        if let Some(intent_id) = &row.stripe_payment_intent_id {
            if let Some(payment) = self.ledger.get_by_intent(intent_id).await? {
                if payment.status == PAYMENT_FAILED {
                    return Ok(Some(ConfirmationOutcome::PaymentFailed {
                        reason: payment
                            .failure_reason
                            .unwrap_or_else(|| "payment failed".to_string()),
                    }));
                }
            }
        }

        Ok(None)
    }

    /// The single authoritative provider query after the local deadline.
    /// Success flows through the identical apply path the webhook uses.
    async fn query_provider_and_apply(
        &self,
        row: &SubscriptionRecord,
    ) -> BillingResult<Option<ConfirmationOutcome>> {
        if let Some(intent_id) = &row.stripe_payment_intent_id {
            let parsed = intent_id
                .parse::<stripe::PaymentIntentId>()
                .map_err(|e| BillingError::Internal(format!("Invalid intent id: {}", e)))?;

            let intent = PaymentIntent::retrieve(self.stripe.inner(), &parsed, &[]).await?;

            return match intent.status {
                PaymentIntentStatus::Succeeded => {
                    let charge_id = intent.latest_charge.as_ref().map(|c| c.id().to_string());
                    self.subscriptions
                        .activate_one_time_purchase(
                            intent_id,
                            charge_id.as_deref(),
                            None,
                            ActorType::System,
                        )
                        .await?;
                    let current = self.require_open(row.user_id, row.course_id).await?;
                    self.enrolled_outcome(&current).await.map(Some)
                }
                PaymentIntentStatus::Canceled => Ok(Some(ConfirmationOutcome::PaymentFailed {
                    reason: "payment was canceled".to_string(),
                })),
                PaymentIntentStatus::RequiresPaymentMethod => {
                    let reason = intent
                        .last_payment_error
                        .as_ref()
                        .and_then(|e| e.message.clone())
                        .unwrap_or_else(|| "payment method was declined".to_string());
                    Ok(Some(ConfirmationOutcome::PaymentFailed { reason }))
                }
                _ => Ok(None),
            };
        }

        if let Some(subscription_id) = &row.stripe_subscription_id {
            let apply = self
                .subscriptions
                .resync_from_remote(subscription_id, None, ActorType::System)
                .await?;

            if apply.status.grants_access() {
                let current = self.require_open(row.user_id, row.course_id).await?;
                return self.enrolled_outcome(&current).await.map(Some);
            }
            if apply.status.is_terminal() {
                return Ok(Some(ConfirmationOutcome::PaymentFailed {
                    reason: "subscription was canceled before activation".to_string(),
                }));
            }
            return Ok(None);
        }

        Err(BillingError::Internal(
            "Purchase row has no remote construct id".to_string(),
        ))
    }

    async fn require_open(&self, user_id: Uuid, course_id: Uuid) -> BillingResult<SubscriptionRecord> {
        self.subscriptions
            .get_open(user_id, course_id)
            .await?
            .ok_or_else(|| BillingError::Internal("Purchase row vanished after apply".to_string()))
    }

    async fn enrolled_outcome(&self, row: &SubscriptionRecord) -> BillingResult<ConfirmationOutcome> {
        let enrollment = self
            .enrollment
            .get_enrollment(row.user_id, row.course_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal("Access granted but enrollment missing".to_string())
            })?;

        Ok(ConfirmationOutcome::Enrolled {
            enrollment,
            status: row.status.clone(),
            subscription_type: row.subscription_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConfirmationConfig;

    #[test]
    fn test_outcome_serialization_shape() {
        let outcome = ConfirmationOutcome::PaymentFailed {
            reason: "card_declined".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "payment_failed");
        assert_eq!(json["reason"], "card_declined");

        let outcome = ConfirmationOutcome::Pending {
            checked_provider: true,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "pending");
        assert_eq!(json["checked_provider"], true);
    }

    #[test]
    fn test_default_bounds_are_hard_ceilings() {
        let config = ConfirmationConfig::default();
        // The local poll plus one provider query must stay within an
        // interactive request budget.
        assert!(config.poll_deadline.as_secs() <= 30);
        assert!(config.provider_query_timeout.as_secs() <= 10);
        assert!(config.poll_interval < config.poll_deadline);
    }
}
