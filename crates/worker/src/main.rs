//! Campus Background Worker
//!
//! Handles scheduled billing jobs:
//! - Webhook replay for events that failed processing (every 5 minutes)
//! - Retry of failed course billing syncs (every 10 minutes)
//! - Enrollment revocation sweep for canceled subscriptions past their
//!   period end (every 15 minutes)

use std::sync::Arc;
use std::time::Duration;

use campus_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Create a database connection pool sized for background work.
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Campus Worker");

    let pool = create_db_pool().await?;

    let billing = Arc::new(
        BillingService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("Billing configuration error: {}", e))?,
    );

    let scheduler = JobScheduler::new().await?;

    // Replay failed webhook events every 5 minutes
    let billing_for_replay = Arc::clone(&billing);
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
            let billing = Arc::clone(&billing_for_replay);
            Box::pin(async move {
                match billing.webhooks.replay_all_failed(Some(50)).await {
                    Ok(results) => {
                        let recovered = results.iter().filter(|r| r.success).count();
                        if !results.is_empty() {
                            info!(
                                replayed = results.len(),
                                recovered = recovered,
                                "Webhook replay cycle complete"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Webhook replay cycle failed"),
                }
            })
        })?)
        .await?;

    // Retry failed course billing syncs every 10 minutes
    let billing_for_sync = Arc::clone(&billing);
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _lock| {
            let billing = Arc::clone(&billing_for_sync);
            Box::pin(async move {
                match billing.sync.retry_failed_syncs(20).await {
                    Ok(recovered) if recovered > 0 => {
                        info!(recovered = recovered, "Recovered failed course syncs")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Sync retry cycle failed"),
                }
            })
        })?)
        .await?;

    // Revoke enrollments for canceled subscriptions past period end
    let billing_for_revoke = Arc::clone(&billing);
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _lock| {
            let billing = Arc::clone(&billing_for_revoke);
            Box::pin(async move {
                match billing.enrollment.sweep_due_revocations(100).await {
                    Ok(revoked) if revoked > 0 => {
                        info!(revoked = revoked, "Enrollment revocation sweep complete")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Revocation sweep failed"),
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Scheduler started with 3 jobs");

    // Keep the process alive; jobs run on the scheduler's tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
