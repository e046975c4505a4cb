//! Redis-backed store of consumed signing nonces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};

use fleetguard_application::NonceRepository;
use fleetguard_core::{AppError, AppResult};

const CONSUME_NONCE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], '1', 'NX', 'PX', ARGV[1]) then
  return 1
end
return 0
"#;

/// Redis implementation of the nonce repository port.
///
/// Expiry is delegated to key TTLs.
#[derive(Clone)]
pub struct RedisNonceRepository {
    client: redis::Client,
    key_prefix: String,
}

impl RedisNonceRepository {
    /// Creates a repository with a configured Redis client and key prefix.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn key_for(&self, nonce: &str) -> String {
        format!("{}:nonce:{nonce}", self.key_prefix)
    }
}

#[async_trait]
impl NonceRepository for RedisNonceRepository {
    async fn is_nonce_consumed(&self, nonce: &str, _now: DateTime<Utc>) -> AppResult<bool> {
        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to connect to redis: {error}"))
            })?;

        connection
            .exists::<_, bool>(self.key_for(nonce))
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to look up redis nonce: {error}"))
            })
    }

    async fn consume_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let ttl_millis = (expires_at - now).num_milliseconds().max(1);

        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to connect to redis: {error}"))
            })?;

        let script = Script::new(CONSUME_NONCE_SCRIPT);
        let consumed: i32 = script
            .key(self.key_for(nonce))
            .arg(ttl_millis)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to consume redis nonce: {error}"))
            })?;

        Ok(consumed == 1)
    }

    async fn cleanup_expired(&self, _now: DateTime<Utc>) -> AppResult<u64> {
        Ok(0)
    }
}
