//! Enrollment service collaborator.
//!
//! Enrollment creation is create-if-absent: the unique `(user_id, course_id)`
//! constraint plus `ON CONFLICT DO NOTHING` makes `ensure_enrollment` safe to
//! call from every transition that reaches an access-granting state, however
//! many times events are redelivered.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of an `ensure_enrollment` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    /// A new enrollment row was created.
    Created,
    /// The enrollment already existed; no change.
    AlreadyEnrolled,
}

/// Enrollment details returned to confirmation callers.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct EnrollmentDetails {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub state: String,
    pub granted_at: OffsetDateTime,
}

/// Idempotent enrollment writer.
#[derive(Clone)]
pub struct EnrollmentService {
    pool: PgPool,
}

impl EnrollmentService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the enrollment if absent. Re-invocation is a no-op for
    /// creation; a pending revocation is cleared since access was re-earned.
    pub async fn ensure_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        state: &str,
    ) -> BillingResult<EnrollmentOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.ensure_enrollment_tx(&mut tx, user_id, course_id, state).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Transactional variant used by the state machine so the enrollment
    /// side effect commits atomically with the status mutation.
    pub async fn ensure_enrollment_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        course_id: Uuid,
        state: &str,
    ) -> BillingResult<EnrollmentOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO enrollments (user_id, course_id, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, course_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(state)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            sqlx::query(
                r#"
                UPDATE enrollments
                SET state = $3, revoke_at = NULL, revoked_at = NULL
                WHERE user_id = $1 AND course_id = $2
                "#,
            )
            .bind(user_id)
            .bind(course_id)
            .bind(state)
            .execute(&mut **tx)
            .await?;
            return Ok(EnrollmentOutcome::AlreadyEnrolled);
        }

        tracing::info!(user_id = %user_id, course_id = %course_id, state = %state, "Enrollment granted");
        Ok(EnrollmentOutcome::Created)
    }

    /// Schedule access revocation. Cancellation keeps access until period
    /// end, never revokes immediately.
    pub async fn schedule_revocation_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        course_id: Uuid,
        revoke_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE enrollments
            SET revoke_at = $3
            WHERE user_id = $1 AND course_id = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(revoke_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> BillingResult<Option<EnrollmentDetails>> {
        let row: Option<EnrollmentDetails> = sqlx::query_as(
            r#"
            SELECT id, user_id, course_id, state, granted_at
            FROM enrollments
            WHERE user_id = $1 AND course_id = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Revoke enrollments whose scheduled time has passed; worker sweep.
    pub async fn sweep_due_revocations(&self, limit: i64) -> BillingResult<usize> {
        let revoked: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE enrollments
            SET revoked_at = NOW(), state = 'revoked'
            WHERE id IN (
                SELECT id FROM enrollments
                WHERE revoke_at IS NOT NULL AND revoke_at <= NOW() AND revoked_at IS NULL
                ORDER BY revoke_at ASC
                LIMIT $1
            )
            RETURNING user_id, course_id
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        for (user_id, course_id) in &revoked {
            tracing::info!(user_id = %user_id, course_id = %course_id, "Enrollment revoked at period end");
        }

        Ok(revoked.len())
    }
}
