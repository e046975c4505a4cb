//! PostgreSQL-backed rate limit repository.
//!
//! Counters, violation tallies and bans each live in one row per identity.
//! Every read-modify-write is a single `INSERT .. ON CONFLICT DO UPDATE`
//! statement so concurrent API replicas never lose an increment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use fleetguard_application::RateLimitRepository;
use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{BanRecord, RateLimitWindow, TierThresholds};


/// PostgreSQL implementation of the rate limit repository port.
#[derive(Clone)]
pub struct PostgresRateLimitRepository {
    pool: PgPool,
}

impl PostgresRateLimitRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitRepository for PostgresRateLimitRepository {
    async fn get_window(&self, identity_key: &str) -> AppResult<Option<RateLimitWindow>> {
        let row = sqlx::query_as::<_, WindowRow>(
            r#"
            SELECT window_started_at, request_count, burst_started_at, burst_count
            FROM rate_limit_windows
            WHERE identity_key = $1
            "#,
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to load rate limit window: {error}"))
        })?;

        row.map(WindowRow::into_window).transpose()
    }

    async fn increment_window(
        &self,
        identity_key: &str,
        thresholds: &TierThresholds,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitWindow> {
        // Both windows roll independently; an elapsed window restarts at `now`
        // with a count of one. Clock skew never moves a window backwards.
        let row = sqlx::query_as::<_, WindowRow>(
            r#"
            INSERT INTO rate_limit_windows (
                identity_key,
                window_started_at,
                request_count,
                burst_started_at,
                burst_count
            )
            VALUES ($1, $2, 1, $2, 1)
            ON CONFLICT (identity_key) DO UPDATE
            SET
                request_count = CASE
                    WHEN $2 - rate_limit_windows.window_started_at >= make_interval(secs => $3::float8)
                    THEN 1
                    ELSE LEAST(rate_limit_windows.request_count, 2147483646) + 1
                END,
                window_started_at = CASE
                    WHEN $2 - rate_limit_windows.window_started_at >= make_interval(secs => $3::float8)
                    THEN $2
                    ELSE rate_limit_windows.window_started_at
                END,
                burst_count = CASE
                    WHEN $2 - rate_limit_windows.burst_started_at >= make_interval(secs => $4::float8)
                    THEN 1
                    ELSE LEAST(rate_limit_windows.burst_count, 2147483646) + 1
                END,
                burst_started_at = CASE
                    WHEN $2 - rate_limit_windows.burst_started_at >= make_interval(secs => $4::float8)
                    THEN $2
                    ELSE rate_limit_windows.burst_started_at
                END
            RETURNING window_started_at, request_count, burst_started_at, burst_count
            "#,
        )
        .bind(identity_key)
        .bind(now)
        .bind(f64::from(thresholds.window_seconds))
        .bind(f64::from(thresholds.burst_window_seconds))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to increment rate limit window: {error}"))
        })?;

        row.into_window()
    }

    async fn record_violation(
        &self,
        identity_key: &str,
        weight: u32,
        period_seconds: u32,
        now: DateTime<Utc>,
    ) -> AppResult<u32> {
        let weight = i32::try_from(weight).map_err(|error| {
            AppError::Validation(format!("invalid rate limit violation weight: {error}"))
        })?;

        let violation_count = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO rate_limit_violations (identity_key, period_started_at, violation_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (identity_key) DO UPDATE
            SET
                violation_count = CASE
                    WHEN $2 - rate_limit_violations.period_started_at >= make_interval(secs => $4::float8)
                    THEN $3
                    ELSE LEAST(rate_limit_violations.violation_count::bigint + $3, 2147483647)::integer
                END,
                period_started_at = CASE
                    WHEN $2 - rate_limit_violations.period_started_at >= make_interval(secs => $4::float8)
                    THEN $2
                    ELSE rate_limit_violations.period_started_at
                END
            RETURNING violation_count
            "#,
        )
        .bind(identity_key)
        .bind(now)
        .bind(weight)
        .bind(f64::from(period_seconds))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to record rate limit violation: {error}"))
        })?;

        to_u32(violation_count, "violation count")
    }

    async fn reset_violations(&self, identity_key: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM rate_limit_violations
            WHERE identity_key = $1
            "#,
        )
        .bind(identity_key)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to reset rate limit violations: {error}"))
        })?;

        Ok(())
    }

    async fn get_ban(&self, identity_key: &str) -> AppResult<Option<BanRecord>> {
        let row = sqlx::query_as::<_, BanRow>(
            r#"
            SELECT identity_key, reason, banned_at, expires_at, offense_count
            FROM rate_limit_bans
            WHERE identity_key = $1
            "#,
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| AppError::StoreUnavailable(format!("failed to load ban: {error}")))?;

        row.map(BanRow::into_record).transpose()
    }

    async fn put_ban(&self, record: BanRecord) -> AppResult<()> {
        let offense_count = i32::try_from(record.offense_count)
            .map_err(|error| AppError::Validation(format!("invalid ban offense count: {error}")))?;

        sqlx::query(
            r#"
            INSERT INTO rate_limit_bans (identity_key, reason, banned_at, expires_at, offense_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (identity_key) DO UPDATE
            SET
                reason = EXCLUDED.reason,
                banned_at = EXCLUDED.banned_at,
                expires_at = GREATEST(rate_limit_bans.expires_at, EXCLUDED.expires_at),
                offense_count = GREATEST(rate_limit_bans.offense_count, EXCLUDED.offense_count)
            "#,
        )
        .bind(record.identity_key.as_str())
        .bind(record.reason.as_str())
        .bind(record.banned_at)
        .bind(record.expires_at)
        .bind(offense_count)
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::StoreUnavailable(format!("failed to store ban: {error}")))?;

        Ok(())
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::StoreUnavailable(format!("failed to begin transaction: {error}"))
        })?;

        let windows = sqlx::query(
            r#"
            DELETE FROM rate_limit_windows
            WHERE window_started_at < $1
            "#,
        )
        .bind(before)
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to cleanup rate limit windows: {error}"))
        })?;

        let violations = sqlx::query(
            r#"
            DELETE FROM rate_limit_violations
            WHERE period_started_at < $1
            "#,
        )
        .bind(before)
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!("failed to cleanup rate limit violations: {error}"))
        })?;

        let bans = sqlx::query(
            r#"
            DELETE FROM rate_limit_bans
            WHERE expires_at < $1
            "#,
        )
        .bind(before)
        .execute(&mut *transaction)
        .await
        .map_err(|error| AppError::StoreUnavailable(format!("failed to cleanup bans: {error}")))?;

        transaction.commit().await.map_err(|error| {
            AppError::StoreUnavailable(format!("failed to commit rate limit cleanup: {error}"))
        })?;

        Ok(windows.rows_affected() + violations.rows_affected() + bans.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WindowRow {
    window_started_at: DateTime<Utc>,
    request_count: i32,
    burst_started_at: DateTime<Utc>,
    burst_count: i32,
}

impl WindowRow {
    fn into_window(self) -> AppResult<RateLimitWindow> {
        Ok(RateLimitWindow {
            window_started_at: self.window_started_at,
            count: to_u32(self.request_count, "request count")?,
            burst_started_at: self.burst_started_at,
            burst_count: to_u32(self.burst_count, "burst count")?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BanRow {
    identity_key: String,
    reason: String,
    banned_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    offense_count: i32,
}

impl BanRow {
    fn into_record(self) -> AppResult<BanRecord> {
        Ok(BanRecord {
            identity_key: self.identity_key,
            reason: self.reason,
            banned_at: self.banned_at,
            expires_at: self.expires_at,
            offense_count: to_u32(self.offense_count, "offense count")?,
        })
    }
}

fn to_u32(value: i32, field: &str) -> AppResult<u32> {
    u32::try_from(value)
        .map_err(|error| AppError::Internal(format!("invalid stored {field} '{value}': {error}")))
}
