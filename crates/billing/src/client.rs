//! Stripe client wrapper and billing configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Pricing strategy tunables.
///
/// The monthly amortization markup is configuration, not a business
/// constant; see `PricingConfig::monthly_amount`.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Percentage added to the base price before amortizing over months.
    pub monthly_markup_percent: i64,
    /// Trial window length offered when a trial is requested.
    pub trial_period_days: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            monthly_markup_percent: 20,
            trial_period_days: 14,
        }
    }
}

impl PricingConfig {
    /// Months a course spans: `ceil(duration_weeks / 4)`, minimum 1.
    pub fn total_months(duration_weeks: i32) -> i64 {
        let weeks = i64::from(duration_weeks.max(1));
        (weeks + 3) / 4
    }

    /// Monthly installment amount in minor units.
    ///
    /// `base * (100 + markup) / 100 / total_months`, ceiling division so the
    /// amortized total never undershoots the marked-up base.
    pub fn monthly_amount(&self, base_amount: i64, duration_weeks: i32) -> i64 {
        let months = Self::total_months(duration_weeks);
        let marked_up = base_amount * (100 + self.monthly_markup_percent);
        (marked_up + 100 * months - 1) / (100 * months)
    }

    /// Whether a course is long enough to offer a monthly installment price.
    pub fn offers_monthly(duration_weeks: i32) -> bool {
        duration_weeks > 4
    }
}

/// Confirmation poller bounds.
///
/// The bounded wait is the only intentional multi-second blocking operation
/// in the engine; every field here is a hard ceiling, not a hint.
#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    /// Total time the poller may spend before giving up locally.
    pub poll_deadline: Duration,
    /// Interval between local row checks.
    pub poll_interval: Duration,
    /// Timeout for the single direct provider query after the deadline.
    pub provider_query_timeout: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_deadline: Duration::from_secs(8),
            poll_interval: Duration::from_millis(500),
            provider_query_timeout: Duration::from_secs(5),
        }
    }
}

/// Stripe configuration loaded from the environment.
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub pricing: PricingConfig,
    pub confirmation: ConfirmationConfig,
}

impl StripeConfig {
    /// Load configuration from environment variables.
    ///
    /// `STRIPE_SECRET_KEY` and `STRIPE_WEBHOOK_SECRET` are required;
    /// missing credentials are fatal at startup. Tunables:
    /// `BILLING_MONTHLY_MARKUP_PERCENT`, `BILLING_TRIAL_PERIOD_DAYS`,
    /// `BILLING_CONFIRM_TIMEOUT_SECS`.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::MissingConfig("STRIPE_SECRET_KEY".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::MissingConfig("STRIPE_WEBHOOK_SECRET".to_string()))?;

        let mut pricing = PricingConfig::default();
        if let Some(markup) = env_i64("BILLING_MONTHLY_MARKUP_PERCENT") {
            pricing.monthly_markup_percent = markup;
        }
        if let Some(days) = env_i64("BILLING_TRIAL_PERIOD_DAYS") {
            pricing.trial_period_days = days.clamp(1, 365) as u32;
        }

        let mut confirmation = ConfirmationConfig::default();
        if let Some(secs) = env_i64("BILLING_CONFIRM_TIMEOUT_SECS") {
            confirmation.poll_deadline = Duration::from_secs(secs.clamp(1, 30) as u64);
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            pricing,
            confirmation,
        })
    }
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Shared Stripe client.
///
/// Cheap to clone; the inner `stripe::Client` is reference counted.
#[derive(Clone)]
pub struct StripeClient {
    inner: Arc<stripe::Client>,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            inner: Arc::new(client),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying Stripe API client.
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_months_rounds_up() {
        assert_eq!(PricingConfig::total_months(2), 1);
        assert_eq!(PricingConfig::total_months(4), 1);
        assert_eq!(PricingConfig::total_months(5), 2);
        assert_eq!(PricingConfig::total_months(16), 4);
        assert_eq!(PricingConfig::total_months(17), 5);
    }

    #[test]
    fn test_monthly_amount_amortizes_markup() {
        let pricing = PricingConfig {
            monthly_markup_percent: 20,
            trial_period_days: 14,
        };
        // 100.00 over 16 weeks: 12000 / 4 months.
        assert_eq!(pricing.monthly_amount(10_000, 16), 3_000);
    }

    #[test]
    fn test_monthly_amount_rounds_up() {
        let pricing = PricingConfig {
            monthly_markup_percent: 20,
            trial_period_days: 14,
        };
        // 99.99 over 12 weeks: 11999 * ... / 3 does not divide evenly.
        let amount = pricing.monthly_amount(9_999, 12);
        assert_eq!(amount, 4_000);
        // Total collected never undershoots the marked-up base.
        assert!(amount * 3 >= 9_999 * 120 / 100);
    }

    #[test]
    fn test_short_courses_have_no_monthly_price() {
        assert!(!PricingConfig::offers_monthly(2));
        assert!(!PricingConfig::offers_monthly(4));
        assert!(PricingConfig::offers_monthly(5));
    }
}
