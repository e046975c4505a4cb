use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fleetguard_core::AppResult;
use fleetguard_domain::{BanRecord, RateLimitWindow, TierThresholds};

/// Repository port for rate limit counters and bans.
///
/// Every read-modify-write method must be atomic per identity key at the
/// store: concurrent handlers share one store and hold no locks of their own.
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// Returns the stored window for an identity, if any.
    async fn get_window(&self, identity_key: &str) -> AppResult<Option<RateLimitWindow>>;

    /// Counts one request at `now`.
    ///
    /// Creates the window on first use. If the main window or the burst
    /// sub-window has elapsed it is rolled to `now` with a count of one,
    /// otherwise its count is incremented. Returns the post-increment state.
    async fn increment_window(
        &self,
        identity_key: &str,
        thresholds: &TierThresholds,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitWindow>;

    /// Adds `weight` to the identity's violation tally and returns the total.
    ///
    /// The tally restarts when the previous one is older than `period_seconds`.
    async fn record_violation(
        &self,
        identity_key: &str,
        weight: u32,
        period_seconds: u32,
        now: DateTime<Utc>,
    ) -> AppResult<u32>;

    /// Clears the violation tally for an identity.
    async fn reset_violations(&self, identity_key: &str) -> AppResult<()>;

    /// Returns the most recent ban for an identity, expired or not.
    async fn get_ban(&self, identity_key: &str) -> AppResult<Option<BanRecord>>;

    /// Stores a ban, keeping the later expiry and higher offense count when
    /// a record already exists.
    async fn put_ban(&self, record: BanRecord) -> AppResult<()>;

    /// Removes windows and violation tallies idle since `before` and bans
    /// that expired before it.
    async fn cleanup_expired(&self, before: DateTime<Utc>) -> AppResult<u64>;
}
