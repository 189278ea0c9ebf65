//! Application state

use std::sync::Arc;

use campus_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    /// Build the state. Missing Stripe credentials are fatal here: a billing
    /// API that cannot reach the provider must not start serving.
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("Billing configuration error: {}", e))?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
        })
    }
}
