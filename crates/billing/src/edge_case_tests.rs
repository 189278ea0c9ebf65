// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Tests critical boundary conditions in:
//! - Pricing strategy (duration boundaries, markup amortization)
//! - Subscription state machine (event ordering, duplicates, regression)
//! - Webhook signature verification (tolerance windows)
//! - Confirmation poller bounds

#[cfg(test)]
mod pricing_edge_cases {
    use crate::catalog::CourseBilling;
    use crate::client::PricingConfig;
    use crate::sync::{desired_prices, BillingPeriod};
    use uuid::Uuid;

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

    // =========================================================================
    // Exactly at the 4-week boundary: one-time only
    // =========================================================================
    #[test]
    fn test_boundary_four_weeks_is_one_time_only() {
        let prices = desired_prices(&course(10_000, 4), &PricingConfig::default());
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].billing_period, BillingPeriod::OneTime);
    }

    // =========================================================================
    // One week past the boundary: monthly appears, amortized over 2 months
    // =========================================================================
    #[test]
    fn test_five_weeks_amortizes_over_two_months() {
        let pricing = PricingConfig {
            monthly_markup_percent: 20,
            trial_period_days: 14,
        };
        let prices = desired_prices(&course(10_000, 5), &pricing);
        assert_eq!(prices.len(), 2);
        // 12000 over 2 months.
        assert_eq!(prices[1].unit_amount, 6_000);
    }

    // =========================================================================
    // Zero markup: monthly is a plain division of the base
    // =========================================================================
    #[test]
    fn test_zero_markup_divides_base() {
        let pricing = PricingConfig {
            monthly_markup_percent: 0,
            trial_period_days: 14,
        };
        assert_eq!(pricing.monthly_amount(12_000, 12), 4_000);
    }

    // =========================================================================
    // Non-divisible amounts round up, never down
    // =========================================================================
    #[test]
    fn test_indivisible_amount_rounds_up() {
        let pricing = PricingConfig {
            monthly_markup_percent: 0,
            trial_period_days: 14,
        };
        // 10000 / 3 = 3333.33; each installment is 3334.
        let monthly = pricing.monthly_amount(10_000, 12);
        assert_eq!(monthly, 3_334);
        assert!(monthly * 3 >= 10_000);
    }

    // =========================================================================
    // Degenerate durations still price sanely
    // =========================================================================
    #[test]
    fn test_zero_and_negative_duration_one_time_only() {
        for weeks in [0, -1] {
            let prices = desired_prices(&course(10_000, weeks), &PricingConfig::default());
            assert_eq!(prices.len(), 1);
            assert_eq!(prices[0].unit_amount, 10_000);
        }
    }

    #[test]
    fn test_seventeen_weeks_spans_five_months() {
        assert_eq!(PricingConfig::total_months(17), 5);
        let pricing = PricingConfig {
            monthly_markup_percent: 20,
            trial_period_days: 14,
        };
        // 12000 over 5 months, ceiling.
        assert_eq!(pricing.monthly_amount(10_000, 17), 2_400);
    }
}

#[cfg(test)]
mod state_machine_edge_cases {
    use crate::subscriptions::SubscriptionStatus::*;
    use crate::subscriptions::{resolve_status, SubscriptionStatus};

    /// Drive a sequence of remote observations through the resolver,
    /// mirroring what repeated webhook deliveries do to a row.
    fn drive(start: SubscriptionStatus, observations: &[SubscriptionStatus]) -> SubscriptionStatus {
        observations
            .iter()
            .fold(start, |current, &target| resolve_status(current, target).0)
    }

    // =========================================================================
    // Trial flow: payment-method-collected then invoice-paid
    // =========================================================================
    #[test]
    fn test_trial_flow_sequence() {
        assert_eq!(drive(Incomplete, &[Trialing, Active]), Active);
    }

    // =========================================================================
    // Duplicated invoice-paid delivery is a no-op
    // =========================================================================
    #[test]
    fn test_duplicate_activation_is_noop() {
        let (status, changed) = resolve_status(Active, Active);
        assert_eq!(status, Active);
        assert!(!changed);
    }

    // =========================================================================
    // Out-of-order: a stale "trialing" observation after activation
    // =========================================================================
    #[test]
    fn test_stale_observation_does_not_regress() {
        assert_eq!(drive(Incomplete, &[Trialing, Active, Trialing]), Active);
        assert_eq!(drive(Incomplete, &[Active, Incomplete]), Active);
    }

    // =========================================================================
    // Dunning cycle: failure, recovery, failure again
    // =========================================================================
    #[test]
    fn test_past_due_recovery_cycle() {
        assert_eq!(drive(Active, &[PastDue, Active, PastDue]), PastDue);
    }

    // =========================================================================
    // Cancellation wins from every state and is sticky
    // =========================================================================
    #[test]
    fn test_cancellation_is_sticky() {
        for start in [Incomplete, Trialing, Active, PastDue] {
            assert_eq!(drive(start, &[Canceled, Active]), Canceled);
            assert_eq!(drive(start, &[Canceled, Trialing]), Canceled);
        }
    }

    // =========================================================================
    // A failed first post-trial charge lands in past_due, recoverable
    // =========================================================================
    #[test]
    fn test_trial_charge_failure_then_recovery() {
        assert_eq!(drive(Incomplete, &[Trialing, PastDue, Active]), Active);
    }
}

#[cfg(test)]
mod confirmation_edge_cases {
    use crate::client::ConfirmationConfig;
    use std::time::Duration;

    // =========================================================================
    // The poll schedule always terminates within the deadline
    // =========================================================================
    #[test]
    fn test_poll_count_is_bounded() {
        let config = ConfirmationConfig::default();
        let polls = config.poll_deadline.as_millis() / config.poll_interval.as_millis();
        assert!(polls >= 2, "At least two local checks before fallback");
        assert!(polls <= 100, "Poll interval too tight for the deadline");
    }

    #[test]
    fn test_interval_never_exceeds_remaining_budget() {
        let config = ConfirmationConfig::default();
        let remaining = Duration::from_millis(120);
        // The poller sleeps min(interval, remaining); verify the clamp math.
        assert_eq!(config.poll_interval.min(remaining), remaining);
        let remaining = Duration::from_secs(60);
        assert_eq!(config.poll_interval.min(remaining), config.poll_interval);
    }
}

#[cfg(test)]
mod concurrency_edge_cases {
    use crate::subscriptions::{resolve_status, SubscriptionStatus};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Barrier;

    // =========================================================================
    // Push and pull racing to apply the same transition: exactly one
    // transition is observed regardless of arrival order
    // =========================================================================
    #[tokio::test]
    async fn test_dual_path_race_applies_transition_once() {
        let row = Arc::new(Mutex::new((SubscriptionStatus::Incomplete, 0usize)));
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = vec![];
        for _ in 0..2 {
            let row = Arc::clone(&row);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                // Serialized section models the row lock both paths take.
                let mut guard = row.lock().unwrap();
                let (next, changed) = resolve_status(guard.0, SubscriptionStatus::Active);
                guard.0 = next;
                if changed {
                    guard.1 += 1;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let guard = row.lock().unwrap();
        assert_eq!(guard.0, SubscriptionStatus::Active);
        assert_eq!(guard.1, 1, "Only the first writer performs the transition");
    }
}
