//! Product and price synchronization.
//!
//! Mirrors course billing configuration into Stripe products and prices.
//! Safe to call repeatedly and concurrently for the same course: every sync
//! runs under a per-course advisory lock spanning "look up local row" →
//! "create remotely if absent" → "persist locally", so two concurrent calls
//! cannot create duplicate remote products.
//!
//! Prices are immutable once created remotely. A price- or
//! duration-affecting course change deactivates every active price for the
//! product (locally and remotely) and creates the newly computed set; the
//! active set never contains two prices of the same billing period.

use sqlx::{PgPool, Postgres, Transaction};
use stripe::{
    CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval, CreateProduct, Currency,
    IdOrCreate, Price, Product, UpdatePrice, UpdateProduct,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::catalog::{CatalogReader, CourseBilling};
use crate::client::{PricingConfig, StripeClient};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Billing period of a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    OneTime,
    Monthly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::OneTime => "one_time",
            BillingPeriod::Monthly => "monthly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "one_time" => Some(BillingPeriod::OneTime),
            "monthly" => Some(BillingPeriod::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A price the synchronizer wants active for a course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPrice {
    pub billing_period: BillingPeriod,
    pub unit_amount: i64,
}

/// Compute the price set a course should carry.
///
/// `duration_weeks <= 4`: a single one-time price at the base amount.
/// Longer courses additionally get a monthly installment price amortized
/// over `ceil(duration_weeks / 4)` months with the configured markup.
pub fn desired_prices(course: &CourseBilling, pricing: &PricingConfig) -> Vec<DesiredPrice> {
    let mut prices = vec![DesiredPrice {
        billing_period: BillingPeriod::OneTime,
        unit_amount: course.price,
    }];

    if PricingConfig::offers_monthly(course.duration_weeks) {
        prices.push(DesiredPrice {
            billing_period: BillingPeriod::Monthly,
            unit_amount: pricing.monthly_amount(course.price, course.duration_weeks),
        });
    }

    prices
}

/// Structured result of one synchronization pass.
///
/// The catalog's mutation path logs this and carries on; a sync failure
/// must never abort course creation or editing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncOutcome {
    pub course_id: Uuid,
    pub product_created: bool,
    pub product_deactivated: bool,
    pub prices_created: usize,
    pub prices_deactivated: usize,
    /// True when the active price set already matched and no remote calls
    /// were made.
    pub unchanged: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ActiveProductRow {
    id: Uuid,
    stripe_product_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ActivePriceRow {
    stripe_price_id: String,
    billing_period: String,
    unit_amount: i64,
}

/// Product and price synchronizer.
pub struct ProductSyncService {
    stripe: StripeClient,
    pool: PgPool,
    catalog: CatalogReader,
    event_logger: BillingEventLogger,
}

impl ProductSyncService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let catalog = CatalogReader::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            catalog,
            event_logger,
        }
    }

    /// Synchronize one course's billing configuration with Stripe.
    ///
    /// Idempotent: an unchanged course makes no remote calls. Errors are
    /// also recorded on the product row so the worker can retry
    /// out-of-band.
    pub async fn sync_course(&self, course_id: Uuid) -> BillingResult<SyncOutcome> {
        let result = self.sync_course_inner(course_id).await;

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    course_id = %course_id,
                    product_created = outcome.product_created,
                    prices_created = outcome.prices_created,
                    prices_deactivated = outcome.prices_deactivated,
                    unchanged = outcome.unchanged,
                    "Course billing sync complete"
                );
            }
            Err(e) => {
                tracing::error!(course_id = %course_id, error = %e, "Course billing sync failed");
                self.record_sync_failure(course_id, e).await;
            }
        }

        result
    }

    async fn sync_course_inner(&self, course_id: Uuid) -> BillingResult<SyncOutcome> {
        let course = self.catalog.get_course(course_id).await?;

        let mut tx = self.pool.begin().await?;

        // Per-course lock; the product row may not exist yet, so lock on the
        // course id rather than a row.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(course_id)
            .execute(&mut *tx)
            .await?;

        let product: Option<ActiveProductRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_product_id
            FROM billing_products
            WHERE course_id = $1 AND is_active
            "#,
        )
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await?;

        if !course.is_sellable() {
            let outcome = match product {
                Some(product) => self.deactivate_product(&mut tx, course_id, product).await?,
                None => SyncOutcome {
                    course_id,
                    product_created: false,
                    product_deactivated: false,
                    prices_created: 0,
                    prices_deactivated: 0,
                    unchanged: true,
                },
            };
            tx.commit().await?;
            return Ok(outcome);
        }

        let (product_row, product_created) = match product {
            Some(row) => (row, false),
            None => (self.create_product(&mut tx, &course).await?, true),
        };

        let desired = desired_prices(&course, &self.stripe.config().pricing);

        let active: Vec<ActivePriceRow> = sqlx::query_as(
            r#"
            SELECT stripe_price_id, billing_period, unit_amount
            FROM billing_prices
            WHERE product_id = $1 AND is_active
            ORDER BY billing_period
            "#,
        )
        .bind(product_row.id)
        .fetch_all(&mut *tx)
        .await?;

        if !product_created && active_matches_desired(&active, &desired) {
            sqlx::query(
                "UPDATE billing_products SET last_synced_at = NOW(), last_sync_error = NULL, updated_at = NOW() WHERE id = $1",
            )
            .bind(product_row.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            return Ok(SyncOutcome {
                course_id,
                product_created: false,
                product_deactivated: false,
                prices_created: 0,
                prices_deactivated: 0,
                unchanged: true,
            });
        }

        // Replace wholesale: deactivate every active price, then create the
        // newly computed set attached to the existing product.
        let deactivated = active.len();
        for row in &active {
            self.deactivate_remote_price(&row.stripe_price_id).await?;
        }
        sqlx::query("UPDATE billing_prices SET is_active = FALSE WHERE product_id = $1 AND is_active")
            .bind(product_row.id)
            .execute(&mut *tx)
            .await?;

        let mut created = 0;
        for price in &desired {
            let stripe_price = self
                .create_remote_price(&product_row.stripe_product_id, price, course_id)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO billing_prices
                    (product_id, stripe_price_id, billing_period, unit_amount, currency, is_active)
                VALUES ($1, $2, $3, $4, 'usd', TRUE)
                "#,
            )
            .bind(product_row.id)
            .bind(stripe_price.id.as_str())
            .bind(price.billing_period.as_str())
            .bind(price.unit_amount)
            .execute(&mut *tx)
            .await?;
            created += 1;
        }

        sqlx::query(
            "UPDATE billing_products SET last_synced_at = NOW(), last_sync_error = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(product_row.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(BillingEventType::PricesReplaced)
                    .course(course_id)
                    .data(serde_json::json!({
                        "product_created": product_created,
                        "prices_created": created,
                        "prices_deactivated": deactivated,
                    }))
                    .actor_type(ActorType::System),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log price replacement event");
        }

        Ok(SyncOutcome {
            course_id,
            product_created,
            product_deactivated: false,
            prices_created: created,
            prices_deactivated: deactivated,
            unchanged: false,
        })
    }

    async fn create_product(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        course: &CourseBilling,
    ) -> BillingResult<ActiveProductRow> {
        let title = course.title.clone();
        let description = course.description.clone();
        let course_id = course.id.to_string();

        let stripe_product = with_retry(|| async {
            let mut params = CreateProduct::new(&title);
            params.description = description.as_deref();
            params.metadata = Some(std::collections::HashMap::from([(
                "course_id".to_string(),
                course_id.clone(),
            )]));
            Product::create(self.stripe.inner(), params).await
        })
        .await?;

        let row: ActiveProductRow = sqlx::query_as(
            r#"
            INSERT INTO billing_products (course_id, stripe_product_id, is_active)
            VALUES ($1, $2, TRUE)
            RETURNING id, stripe_product_id
            "#,
        )
        .bind(course.id)
        .bind(stripe_product.id.as_str())
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            course_id = %course.id,
            stripe_product_id = %row.stripe_product_id,
            "Created Stripe product"
        );

        Ok(row)
    }

    async fn create_remote_price(
        &self,
        stripe_product_id: &str,
        price: &DesiredPrice,
        course_id: Uuid,
    ) -> BillingResult<Price> {
        let course_id = course_id.to_string();

        let created = with_retry(|| async {
            let mut params = CreatePrice::new(Currency::USD);
            // Always attach to the course's existing product; price creation
            // must never spawn an ad-hoc product as a side effect.
            params.product = Some(IdOrCreate::Id(stripe_product_id));
            params.unit_amount = Some(price.unit_amount);
            if price.billing_period == BillingPeriod::Monthly {
                params.recurring = Some(CreatePriceRecurring {
                    interval: CreatePriceRecurringInterval::Month,
                    ..Default::default()
                });
            }
            params.metadata = Some(std::collections::HashMap::from([(
                "course_id".to_string(),
                course_id.clone(),
            )]));
            Price::create(self.stripe.inner(), params).await
        })
        .await?;

        Ok(created)
    }

    async fn deactivate_remote_price(&self, stripe_price_id: &str) -> BillingResult<()> {
        let price_id = stripe_price_id
            .parse::<stripe::PriceId>()
            .map_err(|e| BillingError::Internal(format!("Invalid price id: {}", e)))?;

        with_retry(|| async {
            let params = UpdatePrice {
                active: Some(false),
                ..Default::default()
            };
            Price::update(self.stripe.inner(), &price_id, params).await
        })
        .await?;

        Ok(())
    }

    async fn deactivate_product(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        course_id: Uuid,
        product: ActiveProductRow,
    ) -> BillingResult<SyncOutcome> {
        let active_prices: Vec<(String,)> = sqlx::query_as(
            "SELECT stripe_price_id FROM billing_prices WHERE product_id = $1 AND is_active",
        )
        .bind(product.id)
        .fetch_all(&mut **tx)
        .await?;

        for (stripe_price_id,) in &active_prices {
            self.deactivate_remote_price(stripe_price_id).await?;
        }

        let product_id = product
            .stripe_product_id
            .parse::<stripe::ProductId>()
            .map_err(|e| BillingError::Internal(format!("Invalid product id: {}", e)))?;

        // Deactivate, never delete: the remote records stay for history.
        with_retry(|| async {
            let params = UpdateProduct {
                active: Some(false),
                ..Default::default()
            };
            Product::update(self.stripe.inner(), &product_id, params).await
        })
        .await?;

        sqlx::query("UPDATE billing_prices SET is_active = FALSE WHERE product_id = $1 AND is_active")
            .bind(product.id)
            .execute(&mut **tx)
            .await?;
        sqlx::query(
            "UPDATE billing_products SET is_active = FALSE, last_synced_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(product.id)
        .execute(&mut **tx)
        .await?;

        tracing::info!(
            course_id = %course_id,
            stripe_product_id = %product.stripe_product_id,
            prices_deactivated = active_prices.len(),
            "Deactivated billing product"
        );

        Ok(SyncOutcome {
            course_id,
            product_created: false,
            product_deactivated: true,
            prices_created: 0,
            prices_deactivated: active_prices.len(),
            unchanged: false,
        })
    }

    async fn record_sync_failure(&self, course_id: Uuid, error: &BillingError) {
        let result = sqlx::query(
            r#"
            UPDATE billing_products
            SET last_sync_error = $2, updated_at = NOW()
            WHERE course_id = $1 AND is_active
            "#,
        )
        .bind(course_id)
        .bind(error.to_string())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                course_id = %course_id,
                error = %e,
                "Failed to record sync failure for out-of-band retry"
            );
        }
    }

    /// Retry syncs that previously failed; called by the worker.
    pub async fn retry_failed_syncs(&self, limit: i64) -> BillingResult<usize> {
        let failed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT course_id FROM billing_products
            WHERE is_active AND last_sync_error IS NOT NULL
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0;
        for (course_id,) in failed {
            match self.sync_course(course_id).await {
                Ok(_) => recovered += 1,
                Err(e) => {
                    tracing::warn!(course_id = %course_id, error = %e, "Sync retry failed");
                }
            }
        }

        Ok(recovered)
    }
}

fn active_matches_desired(active: &[ActivePriceRow], desired: &[DesiredPrice]) -> bool {
    if active.len() != desired.len() {
        return false;
    }
    desired.iter().all(|d| {
        active
            .iter()
            .any(|a| a.billing_period == d.billing_period.as_str() && a.unit_amount == d.unit_amount)
    })
}

/// Bounded exponential backoff for transient provider failures.
async fn with_retry<T, F, Fut>(f: F) -> Result<T, stripe::StripeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, stripe::StripeError>>,
{
    let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
    Retry::spawn(strategy, f).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(price: i64, duration_weeks: i32) -> CourseBilling {
        CourseBilling {
            id: Uuid::new_v4(),
            title: "Course".to_string(),
            description: None,
            price,
            duration_weeks,
            is_free: false,
            deleted_at: None,
        }
    }

    // Scenario A: 100.00 over 2 weeks yields a single one-time price.
    #[test]
    fn test_short_course_single_one_time_price() {
        let prices = desired_prices(&course(10_000, 2), &PricingConfig::default());
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].billing_period, BillingPeriod::OneTime);
        assert_eq!(prices[0].unit_amount, 10_000);
    }

    // Scenario B: 100.00 over 16 weeks yields one-time plus amortized monthly.
    #[test]
    fn test_long_course_gets_monthly_price() {
        let pricing = PricingConfig {
            monthly_markup_percent: 20,
            trial_period_days: 14,
        };
        let prices = desired_prices(&course(10_000, 16), &pricing);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].billing_period, BillingPeriod::OneTime);
        assert_eq!(prices[0].unit_amount, 10_000);
        assert_eq!(prices[1].billing_period, BillingPeriod::Monthly);
        assert_eq!(prices[1].unit_amount, pricing.monthly_amount(10_000, 16));
        assert_eq!(prices[1].unit_amount, 3_000);
    }

    #[test]
    fn test_four_week_boundary_has_no_monthly() {
        let prices = desired_prices(&course(10_000, 4), &PricingConfig::default());
        assert_eq!(prices.len(), 1);

        let prices = desired_prices(&course(10_000, 5), &PricingConfig::default());
        assert_eq!(prices.len(), 2);
    }

    #[test]
    fn test_active_matches_desired_ignores_order() {
        let active = vec![
            ActivePriceRow {
                stripe_price_id: "price_a".to_string(),
                billing_period: "monthly".to_string(),
                unit_amount: 3_000,
            },
            ActivePriceRow {
                stripe_price_id: "price_b".to_string(),
                billing_period: "one_time".to_string(),
                unit_amount: 10_000,
            },
        ];
        let desired = vec![
            DesiredPrice {
                billing_period: BillingPeriod::OneTime,
                unit_amount: 10_000,
            },
            DesiredPrice {
                billing_period: BillingPeriod::Monthly,
                unit_amount: 3_000,
            },
        ];
        assert!(active_matches_desired(&active, &desired));
    }

    #[test]
    fn test_amount_change_is_not_a_match() {
        let active = vec![ActivePriceRow {
            stripe_price_id: "price_a".to_string(),
            billing_period: "one_time".to_string(),
            unit_amount: 10_000,
        }];
        let desired = vec![DesiredPrice {
            billing_period: BillingPeriod::OneTime,
            unit_amount: 12_000,
        }];
        assert!(!active_matches_desired(&active, &desired));
    }

    #[test]
    fn test_billing_period_round_trip() {
        assert_eq!(BillingPeriod::from_str("one_time"), Some(BillingPeriod::OneTime));
        assert_eq!(BillingPeriod::from_str("monthly"), Some(BillingPeriod::Monthly));
        assert_eq!(BillingPeriod::from_str("weekly"), None);
        assert_eq!(BillingPeriod::Monthly.to_string(), "monthly");
    }
}
