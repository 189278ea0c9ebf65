//! Purchase initiation.
//!
//! Starts a one-time purchase or a recurring subscription and returns the
//! client secret the front-end uses to collect payment directly with
//! Stripe. The local placeholder row is persisted before the secret is
//! returned, carrying the correlation metadata (user, course, cohort) that
//! later webhook events — which only carry remote ids — are matched
//! against.

use sqlx::PgPool;
use stripe::{
    CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods, CreateSubscription,
    CreateSubscriptionItems, CreateSubscriptionPaymentSettings,
    CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod, Currency, PaymentIntent,
    Subscription as StripeSubscription, SubscriptionPaymentBehavior,
};
use uuid::Uuid;

use crate::catalog::CatalogReader;
use crate::client::StripeClient;
use crate::customers::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::payments::PaymentLedger;
use crate::subscriptions::{SubscriptionService, SubscriptionType};
use crate::sync::BillingPeriod;

/// Which kind of client secret the response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    /// Secret confirms a payment immediately.
    PaymentIntent,
    /// Secret collects a payment method for a trialing subscription.
    SetupIntent,
}

/// Response of a successful initiation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutIntent {
    pub client_secret: String,
    pub intent_type: IntentType,
    /// Remote construct id: payment intent for one-time purchases,
    /// subscription for recurring ones.
    pub construct_id: String,
    /// Local placeholder row the confirmation poller watches.
    pub subscription_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct ActivePriceRow {
    stripe_price_id: String,
    unit_amount: i64,
}

/// Purchase and subscription initiator.
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    catalog: CatalogReader,
    customers: CustomerService,
    subscriptions: SubscriptionService,
    ledger: PaymentLedger,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool, email: crate::email::BillingEmailService) -> Self {
        let catalog = CatalogReader::new(pool.clone());
        let customers = CustomerService::new(stripe.clone(), pool.clone());
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone(), email);
        let ledger = PaymentLedger::new(pool.clone());
        Self {
            stripe,
            pool,
            catalog,
            customers,
            subscriptions,
            ledger,
        }
    }

    /// Start a purchase.
    ///
    /// Validation failures (free course, unknown pricing, open purchase)
    /// are rejected immediately and never retried; provider failures are
    /// surfaced as retryable.
    pub async fn initiate(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        pricing_type: BillingPeriod,
        trial_requested: bool,
        cohort_id: Option<Uuid>,
    ) -> BillingResult<CheckoutIntent> {
        let course = self.catalog.get_course(course_id).await?;
        if !course.is_sellable() {
            return Err(BillingError::CourseIsFree);
        }

        if self.subscriptions.get_open(user_id, course_id).await?.is_some() {
            return Err(BillingError::PurchaseAlreadyOpen);
        }

        // The price must already exist on the course's billing product; the
        // initiator never creates products or prices on the fly.
        let price = self.active_price(course_id, pricing_type).await?;

        let customer_id = self.customers.get_or_create_customer(user_id).await?;

        let metadata = purchase_metadata(user_id, course_id, cohort_id);

        match pricing_type {
            BillingPeriod::OneTime => {
                self.initiate_one_time(user_id, course_id, cohort_id, &customer_id, &price, metadata)
                    .await
            }
            BillingPeriod::Monthly => {
                self.initiate_subscription(
                    user_id,
                    course_id,
                    cohort_id,
                    &customer_id,
                    &price,
                    trial_requested,
                    metadata,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn initiate_one_time(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        cohort_id: Option<Uuid>,
        customer_id: &str,
        price: &ActivePriceRow,
        metadata: std::collections::HashMap<String, String>,
    ) -> BillingResult<CheckoutIntent> {
        let customer = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::Internal(format!("Invalid customer id: {}", e)))?;

        let mut params = CreatePaymentIntent::new(price.unit_amount, Currency::USD);
        params.customer = Some(customer);
        params.metadata = Some(metadata);
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            ..Default::default()
        });

        let intent = PaymentIntent::create(self.stripe.inner(), params).await?;
        let intent_id = intent.id.to_string();

        let client_secret = intent
            .client_secret
            .clone()
            .ok_or_else(|| BillingError::Internal("Payment intent has no client secret".to_string()))?;

        // Placeholder rows go in before the secret leaves the process.
        let subscription_id = self
            .subscriptions
            .create_placeholder(
                user_id,
                course_id,
                cohort_id,
                SubscriptionType::OneTime,
                None,
                Some(&intent_id),
                None,
            )
            .await?;
        self.ledger
            .insert_pending_intent(user_id, course_id, &intent_id, price.unit_amount)
            .await?;

        tracing::info!(
            user_id = %user_id,
            course_id = %course_id,
            payment_intent = %intent_id,
            amount = price.unit_amount,
            "One-time purchase initiated"
        );

        Ok(CheckoutIntent {
            client_secret,
            intent_type: IntentType::PaymentIntent,
            construct_id: intent_id,
            subscription_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn initiate_subscription(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        cohort_id: Option<Uuid>,
        customer_id: &str,
        price: &ActivePriceRow,
        trial_requested: bool,
        metadata: std::collections::HashMap<String, String>,
    ) -> BillingResult<CheckoutIntent> {
        let customer = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::Internal(format!("Invalid customer id: {}", e)))?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price.stripe_price_id.clone()),
            ..Default::default()
        }]);
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        // Save the collected payment method onto the subscription so renewal
        // charges and the payment-method-collected gate both see it.
        params.payment_settings = Some(CreateSubscriptionPaymentSettings {
            save_default_payment_method: Some(
                CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription,
            ),
            ..Default::default()
        });
        params.metadata = Some(metadata);
        if trial_requested {
            params.trial_period_days = Some(self.stripe.config().pricing.trial_period_days);
        }
        params.expand = &["latest_invoice.payment_intent", "pending_setup_intent"];

        let subscription = StripeSubscription::create(self.stripe.inner(), params).await?;
        let construct_id = subscription.id.to_string();

        let trial_end = subscription
            .trial_end
            .and_then(|t| time::OffsetDateTime::from_unix_timestamp(t).ok());
        let subscription_type = if trial_requested {
            SubscriptionType::Trial
        } else {
            SubscriptionType::Monthly
        };

        let subscription_id = self
            .subscriptions
            .create_placeholder(
                user_id,
                course_id,
                cohort_id,
                subscription_type,
                Some(&construct_id),
                None,
                trial_end,
            )
            .await?;

        let (client_secret, intent_type) = extract_client_secret(&subscription)?;

        tracing::info!(
            user_id = %user_id,
            course_id = %course_id,
            stripe_subscription_id = %construct_id,
            trial = trial_requested,
            "Subscription initiated"
        );

        Ok(CheckoutIntent {
            client_secret,
            intent_type,
            construct_id,
            subscription_id,
        })
    }

    async fn active_price(
        &self,
        course_id: Uuid,
        pricing_type: BillingPeriod,
    ) -> BillingResult<ActivePriceRow> {
        let row: Option<ActivePriceRow> = sqlx::query_as(
            r#"
            SELECT pr.stripe_price_id, pr.unit_amount
            FROM billing_prices pr
            JOIN billing_products p ON p.id = pr.product_id
            WHERE p.course_id = $1 AND p.is_active
              AND pr.billing_period = $2 AND pr.is_active
            "#,
        )
        .bind(course_id)
        .bind(pricing_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(BillingError::NoActivePrice {
            course_id,
            billing_period: pricing_type.as_str().to_string(),
        })
    }
}

fn purchase_metadata(
    user_id: Uuid,
    course_id: Uuid,
    cohort_id: Option<Uuid>,
) -> std::collections::HashMap<String, String> {
    let mut metadata = std::collections::HashMap::from([
        ("user_id".to_string(), user_id.to_string()),
        ("course_id".to_string(), course_id.to_string()),
    ]);
    if let Some(cohort_id) = cohort_id {
        metadata.insert("cohort_id".to_string(), cohort_id.to_string());
    }
    metadata
}

/// Pull the collectable secret out of a freshly created subscription.
///
/// A trialing subscription has no chargeable invoice yet; Stripe attaches a
/// setup intent for collecting the payment method instead.
fn extract_client_secret(
    subscription: &StripeSubscription,
) -> BillingResult<(String, IntentType)> {
    if let Some(setup_intent) = subscription
        .pending_setup_intent
        .as_ref()
        .and_then(|si| si.as_object())
    {
        if let Some(secret) = setup_intent.client_secret.clone() {
            return Ok((secret, IntentType::SetupIntent));
        }
    }

    let payment_intent_secret = subscription
        .latest_invoice
        .as_ref()
        .and_then(|inv| inv.as_object())
        .and_then(|inv| inv.payment_intent.as_ref())
        .and_then(|pi| pi.as_object())
        .and_then(|pi| pi.client_secret.clone());

    match payment_intent_secret {
        Some(secret) => Ok((secret, IntentType::PaymentIntent)),
        None => Err(BillingError::Internal(
            "Subscription has neither a setup intent nor an invoice payment intent".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_metadata_carries_correlation_ids() {
        let user_id = Uuid::new_v4();
        let course_id = Uuid::new_v4();
        let cohort_id = Uuid::new_v4();

        let metadata = purchase_metadata(user_id, course_id, Some(cohort_id));
        assert_eq!(metadata.get("user_id"), Some(&user_id.to_string()));
        assert_eq!(metadata.get("course_id"), Some(&course_id.to_string()));
        assert_eq!(metadata.get("cohort_id"), Some(&cohort_id.to_string()));

        let metadata = purchase_metadata(user_id, course_id, None);
        assert!(!metadata.contains_key("cohort_id"));
    }

    #[test]
    fn test_intent_type_serialization() {
        assert_eq!(
            serde_json::to_string(&IntentType::PaymentIntent).unwrap(),
            "\"payment_intent\""
        );
        assert_eq!(
            serde_json::to_string(&IntentType::SetupIntent).unwrap(),
            "\"setup_intent\""
        );
    }
}
