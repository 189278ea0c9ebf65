//! Customer account management.
//!
//! Customer accounts are created lazily on the first purchase attempt; the
//! insert races are settled by the unique constraint on `user_id` rather
//! than a lock.

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer};
use uuid::Uuid;

use crate::catalog::CatalogReader;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Customer account service.
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
    catalog: CatalogReader,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let catalog = CatalogReader::new(pool.clone());
        Self {
            stripe,
            pool,
            catalog,
        }
    }

    /// Get the user's Stripe customer id, creating the remote customer and
    /// the local account row on first use.
    pub async fn get_or_create_customer(&self, user_id: Uuid) -> BillingResult<String> {
        if let Some(existing) = self.get_customer_id(user_id).await? {
            return Ok(existing);
        }

        let email = self.catalog.get_user_email(user_id).await?;

        let mut params = CreateCustomer::new();
        params.email = Some(&email);
        let metadata = std::collections::HashMap::from([(
            "user_id".to_string(),
            user_id.to_string(),
        )]);
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;

        // A concurrent request may have created the account between our
        // check and this insert; the unique constraint keeps one winner and
        // we re-read the surviving row.
        let inserted = sqlx::query(
            r#"
            INSERT INTO customer_accounts (user_id, stripe_customer_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(customer.id.as_str())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            tracing::info!(
                user_id = %user_id,
                orphaned_customer = %customer.id,
                "Lost customer creation race; using existing account"
            );
            return self
                .get_customer_id(user_id)
                .await?
                .ok_or_else(|| BillingError::Internal("customer account vanished".to_string()));
        }

        tracing::info!(
            user_id = %user_id,
            stripe_customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    pub async fn get_customer_id(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT stripe_customer_id FROM customer_accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Resolve a Stripe customer id back to the platform user.
    pub async fn user_for_customer(&self, stripe_customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM customer_accounts WHERE stripe_customer_id = $1",
        )
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }
}
