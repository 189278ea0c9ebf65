//! Read-only port onto the course catalog.
//!
//! The catalog service owns the `courses` table; billing only reads the
//! fields it needs to mirror a course into sellable products and prices.
//! The catalog's mutation path invokes `ProductSyncService::sync_course`
//! as a post-commit hook; billing never writes catalog entities back, which
//! keeps the dependency graph acyclic.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Billing-relevant view of a course.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CourseBilling {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Base price in minor currency units.
    pub price: i64,
    pub duration_weeks: i32,
    pub is_free: bool,
    pub deleted_at: Option<time::OffsetDateTime>,
}

impl CourseBilling {
    /// A course is sellable when it is neither free nor deleted.
    pub fn is_sellable(&self) -> bool {
        !self.is_free && self.deleted_at.is_none() && self.price > 0
    }
}

/// Reader over the catalog's course table.
#[derive(Clone)]
pub struct CatalogReader {
    pool: PgPool,
}

impl CatalogReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_course(&self, course_id: Uuid) -> BillingResult<CourseBilling> {
        let course: Option<CourseBilling> = sqlx::query_as(
            r#"
            SELECT id, title, description, price, duration_weeks, is_free, deleted_at
            FROM courses
            WHERE id = $1
            "#,
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        course.ok_or_else(|| BillingError::NotFound(format!("Course {} not found", course_id)))
    }

    /// User email for customer-account creation (identity collaborator).
    pub async fn get_user_email(&self, user_id: Uuid) -> BillingResult<String> {
        let row: Option<(String,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(email,)| email)
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(price: i64, is_free: bool, deleted: bool) -> CourseBilling {
        CourseBilling {
            id: Uuid::new_v4(),
            title: "Intro to Systems".to_string(),
            description: None,
            price,
            duration_weeks: 8,
            is_free,
            deleted_at: deleted.then(time::OffsetDateTime::now_utc),
        }
    }

    #[test]
    fn test_sellable_requires_price_and_not_deleted() {
        assert!(course(10_000, false, false).is_sellable());
        assert!(!course(10_000, true, false).is_sellable());
        assert!(!course(10_000, false, true).is_sellable());
        assert!(!course(0, false, false).is_sellable());
    }
}
