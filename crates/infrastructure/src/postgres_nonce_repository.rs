//! PostgreSQL-backed store of consumed signing nonces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use fleetguard_application::NonceRepository;
use fleetguard_core::{AppError, AppResult};

#[cfg(test)]
mod tests;

/// PostgreSQL implementation of the nonce repository port.
#[derive(Clone)]
pub struct PostgresNonceRepository {
    pool: PgPool,
}

impl PostgresNonceRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NonceRepository for PostgresNonceRepository {
    async fn is_nonce_consumed(&self, nonce: &str, now: DateTime<Utc>) -> AppResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM signing_nonces
                WHERE nonce = $1
                  AND expires_at > $2
            )
            "#,
        )
        .bind(nonce)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| AppError::StoreUnavailable(format!("failed to look up nonce: {error}")))
    }

    async fn consume_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        // A live row makes the conditional update a no-op, so nothing is returned.
        let consumed = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO signing_nonces (nonce, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (nonce) DO UPDATE
            SET expires_at = EXCLUDED.expires_at
            WHERE signing_nonces.expires_at <= $3
            RETURNING nonce
            "#,
        )
        .bind(nonce)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| AppError::StoreUnavailable(format!("failed to consume nonce: {error}")))?;

        Ok(consumed.is_some())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM signing_nonces
            WHERE expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to cleanup expired nonces: {error}"))
        })?;

        Ok(result.rows_affected())
    }
}
