//! Redis-backed rate limit repository.
//!
//! Each read-modify-write runs as one Lua script, so counters stay exact
//! across API replicas. Timestamps are stored as epoch milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::Script;
use redis::aio::MultiplexedConnection;

use fleetguard_application::RateLimitRepository;
use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{BanRecord, RateLimitWindow, TierThresholds};

const INCREMENT_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'window_started_at', 'count', 'burst_started_at', 'burst_count')
local window_started_at = tonumber(state[1])
local count = tonumber(state[2])
local burst_started_at = tonumber(state[3])
local burst_count = tonumber(state[4])

if window_started_at == nil then
  window_started_at = now
  count = 1
  burst_started_at = now
  burst_count = 1
else
  if now - window_started_at >= window then
    window_started_at = now
    count = 1
  else
    count = count + 1
  end

  if now - burst_started_at >= burst then
    burst_started_at = now
    burst_count = 1
  else
    burst_count = burst_count + 1
  end
end

redis.call('HSET', key,
  'window_started_at', window_started_at,
  'count', count,
  'burst_started_at', burst_started_at,
  'burst_count', burst_count)
redis.call('PEXPIRE', key, window * 2)

return {window_started_at, count, burst_started_at, burst_count}
"#;

const RECORD_VIOLATION_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local weight = tonumber(ARGV[2])
local period = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'period_started_at', 'count')
local period_started_at = tonumber(state[1])
local count = tonumber(state[2])

if period_started_at == nil or now - period_started_at >= period then
  period_started_at = now
  count = weight
else
  count = count + weight
end

redis.call('HSET', key, 'period_started_at', period_started_at, 'count', count)
redis.call('PEXPIRE', key, period)

return count
"#;

const PUT_BAN_SCRIPT: &str = r#"
local key = KEYS[1]
local expires_at = tonumber(ARGV[3])
local offense_count = tonumber(ARGV[4])
local retention = tonumber(ARGV[5])

local existing = redis.call('HMGET', key, 'expires_at', 'offense_count')
if existing[1] then
  expires_at = math.max(expires_at, tonumber(existing[1]))
end
if existing[2] then
  offense_count = math.max(offense_count, tonumber(existing[2]))
end

redis.call('HSET', key,
  'reason', ARGV[1],
  'banned_at', ARGV[2],
  'expires_at', expires_at,
  'offense_count', offense_count)
redis.call('PEXPIREAT', key, expires_at + retention)

return 1
"#;

/// How long a ban record outlives its expiry, for repeat-offense escalation.
const DEFAULT_BAN_RETENTION_SECONDS: u32 = 24 * 60 * 60;

/// Redis implementation of the rate limit repository port.
#[derive(Clone)]
pub struct RedisRateLimitRepository {
    client: redis::Client,
    key_prefix: String,
    ban_retention_seconds: u32,
}

impl RedisRateLimitRepository {
    /// Creates a repository with a configured Redis client and key prefix.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            ban_retention_seconds: DEFAULT_BAN_RETENTION_SECONDS,
        }
    }

    /// Keeps expired bans for `seconds` so later bans still escalate.
    ///
    /// Should match the limiter's escalation period.
    #[must_use]
    pub fn with_ban_retention(mut self, seconds: u32) -> Self {
        self.ban_retention_seconds = seconds;
        self
    }

    fn key_for(&self, kind: &str, identity_key: &str) -> String {
        format!("{}:{kind}:{identity_key}", self.key_prefix)
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to connect to redis: {error}"))
            })
    }
}

#[async_trait]
impl RateLimitRepository for RedisRateLimitRepository {
    async fn get_window(&self, identity_key: &str) -> AppResult<Option<RateLimitWindow>> {
        let mut connection = self.connection().await?;
        let (window_started_at, count, burst_started_at, burst_count): (
            Option<i64>,
            Option<u32>,
            Option<i64>,
            Option<u32>,
        ) = redis::cmd("HMGET")
            .arg(self.key_for("window", identity_key))
            .arg("window_started_at")
            .arg("count")
            .arg("burst_started_at")
            .arg("burst_count")
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to load redis rate limit window: {error}"))
            })?;

        match (window_started_at, count, burst_started_at, burst_count) {
            (Some(window_started_at), Some(count), Some(burst_started_at), Some(burst_count)) => {
                Ok(Some(RateLimitWindow {
                    window_started_at: from_millis(window_started_at)?,
                    count,
                    burst_started_at: from_millis(burst_started_at)?,
                    burst_count,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn increment_window(
        &self,
        identity_key: &str,
        thresholds: &TierThresholds,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitWindow> {
        let mut connection = self.connection().await?;

        let script = Script::new(INCREMENT_WINDOW_SCRIPT);
        let (window_started_at, count, burst_started_at, burst_count): (i64, i64, i64, i64) =
            script
                .key(self.key_for("window", identity_key))
                .arg(now.timestamp_millis())
                .arg(i64::from(thresholds.window_seconds) * 1_000)
                .arg(i64::from(thresholds.burst_window_seconds) * 1_000)
                .invoke_async(&mut connection)
                .await
                .map_err(|error| {
                    AppError::StoreUnavailable(format!(
                        "failed to increment redis rate limit window: {error}"
                    ))
                })?;

        Ok(RateLimitWindow {
            window_started_at: from_millis(window_started_at)?,
            count: to_u32(count, "request count")?,
            burst_started_at: from_millis(burst_started_at)?,
            burst_count: to_u32(burst_count, "burst count")?,
        })
    }

    async fn record_violation(
        &self,
        identity_key: &str,
        weight: u32,
        period_seconds: u32,
        now: DateTime<Utc>,
    ) -> AppResult<u32> {
        let mut connection = self.connection().await?;

        let script = Script::new(RECORD_VIOLATION_SCRIPT);
        let count: i64 = script
            .key(self.key_for("violations", identity_key))
            .arg(now.timestamp_millis())
            .arg(weight)
            .arg(i64::from(period_seconds) * 1_000)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to record redis rate limit violation: {error}"
                ))
            })?;

        to_u32(count, "violation count")
    }

    async fn reset_violations(&self, identity_key: &str) -> AppResult<()> {
        let mut connection = self.connection().await?;

        redis::cmd("DEL")
            .arg(self.key_for("violations", identity_key))
            .query_async::<()>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to reset redis rate limit violations: {error}"
                ))
            })
    }

    async fn get_ban(&self, identity_key: &str) -> AppResult<Option<BanRecord>> {
        let mut connection = self.connection().await?;
        let (reason, banned_at, expires_at, offense_count): (
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<u32>,
        ) = redis::cmd("HMGET")
            .arg(self.key_for("ban", identity_key))
            .arg("reason")
            .arg("banned_at")
            .arg("expires_at")
            .arg("offense_count")
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to load redis ban: {error}"))
            })?;

        match (reason, banned_at, expires_at, offense_count) {
            (Some(reason), Some(banned_at), Some(expires_at), Some(offense_count)) => {
                Ok(Some(BanRecord {
                    identity_key: identity_key.to_owned(),
                    reason,
                    banned_at: from_millis(banned_at)?,
                    expires_at: from_millis(expires_at)?,
                    offense_count,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn put_ban(&self, record: BanRecord) -> AppResult<()> {
        let mut connection = self.connection().await?;

        let script = Script::new(PUT_BAN_SCRIPT);
        script
            .key(self.key_for("ban", record.identity_key.as_str()))
            .arg(record.reason.as_str())
            .arg(record.banned_at.timestamp_millis())
            .arg(record.expires_at.timestamp_millis())
            .arg(record.offense_count)
            .arg(i64::from(self.ban_retention_seconds) * 1_000)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to store redis ban: {error}"))
            })?;

        Ok(())
    }

    async fn cleanup_expired(&self, _before: DateTime<Utc>) -> AppResult<u64> {
        // Redis rate limit keys expire automatically via TTL.
        Ok(0)
    }
}

fn from_millis(millis: i64) -> AppResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AppError::Internal(format!("invalid redis timestamp: {millis}")))
}

fn to_u32(value: i64, field: &str) -> AppResult<u32> {
    u32::try_from(value)
        .map_err(|error| AppError::Internal(format!("invalid redis {field} '{value}': {error}")))
}
