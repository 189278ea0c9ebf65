// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Campus Billing Engine
//!
//! Keeps locally-held billing records consistent with Stripe under
//! asynchronous, at-least-once, possibly out-of-order webhook delivery.
//!
//! ## Components
//!
//! - **Product sync**: Mirrors course billing configuration into Stripe
//!   products and prices
//! - **Checkout**: Starts one-time purchases and subscriptions, returns the
//!   client secret for payment collection
//! - **Webhooks**: Idempotently applies provider-pushed state changes
//! - **Confirmation**: Bridges client-side confirmation and webhook latency
//! - **Subscriptions**: The state machine shared by the push and pull paths
//! - **Enrollment**: Idempotent create-if-absent access granting

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod confirmation;
pub mod customers;
pub mod email;
pub mod enrollment;
pub mod error;
pub mod events;
pub mod invariants;
pub mod payments;
pub mod subscriptions;
pub mod sync;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{CatalogReader, CourseBilling};

// Checkout
pub use checkout::{CheckoutIntent, CheckoutService, IntentType};

// Client
pub use client::{ConfirmationConfig, PricingConfig, StripeClient, StripeConfig};

// Confirmation
pub use confirmation::{ConfirmationOutcome, ConfirmationService};

// Customers
pub use customers::CustomerService;

// Email
pub use email::{BillingEmailService, EmailConfig};

// Enrollment
pub use enrollment::{EnrollmentDetails, EnrollmentOutcome, EnrollmentService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Payments
pub use payments::{PaymentLedger, PaymentRecord};

// Subscriptions
pub use subscriptions::{
    ApplyResult, SubscriptionRecord, SubscriptionService, SubscriptionStatus, SubscriptionType,
};

// Sync
pub use sync::{BillingPeriod, DesiredPrice, ProductSyncService, SyncOutcome};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookReplayResult};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub sync: ProductSyncService,
    pub checkout: CheckoutService,
    pub customers: CustomerService,
    pub subscriptions: SubscriptionService,
    pub confirmation: ConfirmationService,
    pub webhooks: WebhookHandler,
    pub enrollment: EnrollmentService,
    pub payments: PaymentLedger,
    pub email: BillingEmailService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        let email = BillingEmailService::from_env();

        Self {
            sync: ProductSyncService::new(stripe.clone(), pool.clone()),
            checkout: CheckoutService::new(stripe.clone(), pool.clone(), email.clone()),
            customers: CustomerService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone(), email.clone()),
            confirmation: ConfirmationService::new(stripe.clone(), pool.clone(), email.clone()),
            webhooks: WebhookHandler::new(stripe, pool.clone(), email.clone()),
            enrollment: EnrollmentService::new(pool.clone()),
            payments: PaymentLedger::new(pool),
            email,
        }
    }
}
