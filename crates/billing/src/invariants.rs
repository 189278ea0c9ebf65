//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may be charged or granted access incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateProductRow {
    course_id: Uuid,
    product_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicatePriceRow {
    product_id: Uuid,
    billing_period: String,
    price_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoPeriodEndRow {
    sub_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    sub_id: Uuid,
    user_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingEnrollmentRow {
    sub_id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingPaymentRow {
    payment_id: Uuid,
    user_id: Uuid,
    created_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_product().await?);
        violations.extend(self.check_single_active_price_per_period().await?);
        violations.extend(self.check_canceled_has_period_end().await?);
        violations.extend(self.check_subscription_has_customer().await?);
        violations.extend(self.check_access_has_enrollment().await?);
        violations.extend(self.check_stale_pending_payments().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most one active billing product per course
    ///
    /// A second active product would let the initiator attach prices to the
    /// wrong product and double-sell the course.
    async fn check_single_active_product(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateProductRow> = sqlx::query_as(
            r#"
            SELECT course_id, COUNT(*) as product_count
            FROM billing_products
            WHERE is_active
            GROUP BY course_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_product".to_string(),
                description: format!(
                    "Course {} has {} active billing products (expected 1)",
                    row.course_id, row.product_count
                ),
                context: serde_json::json!({
                    "course_id": row.course_id,
                    "product_count": row.product_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: At most one active price per (product, billing period)
    ///
    /// Two active prices of the same period would make the initiator's
    /// price lookup ambiguous.
    async fn check_single_active_price_per_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicatePriceRow> = sqlx::query_as(
            r#"
            SELECT product_id, billing_period, COUNT(*) as price_count
            FROM billing_prices
            WHERE is_active
            GROUP BY product_id, billing_period
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_price_per_period".to_string(),
                description: format!(
                    "Product {} has {} active '{}' prices (expected 1)",
                    row.product_id, row.price_count, row.billing_period
                ),
                context: serde_json::json!({
                    "product_id": row.product_id,
                    "billing_period": row.billing_period,
                    "price_count": row.price_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Canceled recurring subscriptions have a period end
    ///
    /// Revocation is scheduled at period end; without one, access would
    /// never be revoked.
    async fn check_canceled_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id
            FROM subscriptions s
            WHERE s.status = 'canceled'
              AND s.stripe_subscription_id IS NOT NULL
              AND s.current_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_period_end".to_string(),
                description: "Canceled subscription has no period end date".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "user_id": row.user_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Recurring subscriptions belong to a customer account
    async fn check_subscription_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id, s.status
            FROM subscriptions s
            WHERE s.stripe_subscription_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM customer_accounts c WHERE c.user_id = s.user_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_has_customer".to_string(),
                description: format!(
                    "Subscription {} ({}) has no customer account",
                    row.sub_id, row.status
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "user_id": row.user_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Access-granting subscriptions have an enrollment
    ///
    /// A trialing/active subscription whose enrollment side effect never
    /// landed means a paying user without course access.
    async fn check_access_has_enrollment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingEnrollmentRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id, s.course_id, s.status
            FROM subscriptions s
            WHERE s.status IN ('trialing', 'active')
              AND NOT EXISTS (
                  SELECT 1 FROM enrollments e
                  WHERE e.user_id = s.user_id
                    AND e.course_id = s.course_id
                    AND e.revoked_at IS NULL
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "access_has_enrollment".to_string(),
                description: format!(
                    "Subscription {} is '{}' but user {} has no enrollment for course {}",
                    row.sub_id, row.status, row.user_id, row.course_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "user_id": row.user_id,
                    "course_id": row.course_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: Pending payments settle within a day
    ///
    /// A placeholder stuck in `pending` means both the webhook and the
    /// confirmation fallback missed it.
    async fn check_stale_pending_payments(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingPaymentRow> = sqlx::query_as(
            r#"
            SELECT id as payment_id, user_id, created_at
            FROM payments
            WHERE status = 'pending'
              AND created_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_payments".to_string(),
                description: format!(
                    "Payment {} has been pending since {}",
                    row.payment_id, row.created_at
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "user_id": row.user_id,
                    "created_at": row.created_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_product" => self.check_single_active_product().await,
            "single_active_price_per_period" => self.check_single_active_price_per_period().await,
            "canceled_has_period_end" => self.check_canceled_has_period_end().await,
            "subscription_has_customer" => self.check_subscription_has_customer().await,
            "access_has_enrollment" => self.check_access_has_enrollment().await,
            "no_stale_pending_payments" => self.check_stale_pending_payments().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_product",
            "single_active_price_per_period",
            "canceled_has_period_end",
            "subscription_has_customer",
            "access_has_enrollment",
            "no_stale_pending_payments",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_active_product"));
        assert!(checks.contains(&"access_has_enrollment"));
    }
}
