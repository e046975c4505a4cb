use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fleetguard_core::AppResult;

/// Repository port for single-use signing nonces.
#[async_trait]
pub trait NonceRepository: Send + Sync {
    /// Returns whether a live (unexpired) record exists for the nonce.
    async fn is_nonce_consumed(&self, nonce: &str, now: DateTime<Utc>) -> AppResult<bool>;

    /// Marks a nonce consumed until `expires_at`.
    ///
    /// Must be an atomic insert-if-absent: returns `true` when this call
    /// consumed the nonce and `false` when a live record already existed.
    /// Expired records are treated as absent.
    async fn consume_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Removes records that expired before `now`.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;
}
