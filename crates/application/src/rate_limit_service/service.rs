use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{
    BanRecord, FailurePolicy, Identity, RateLimitDecision, RateLimitWindow, Tier,
};

use super::config::RateLimitConfig;
use super::ports::RateLimitRepository;
use crate::store_guard::with_store_timeout;

/// Minimum age of counters removed by [`RateLimitService::cleanup`].
const IDLE_RETENTION_HOURS: i64 = 24;

/// Application service for tiered rate limiting with escalating bans.
#[derive(Clone)]
pub struct RateLimitService {
    repository: Arc<dyn RateLimitRepository>,
    config: Arc<RateLimitConfig>,
}

impl RateLimitService {
    /// Creates a new rate limit service.
    #[must_use]
    pub fn new(repository: Arc<dyn RateLimitRepository>, config: RateLimitConfig) -> Self {
        Self {
            repository,
            config: Arc::new(config),
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts a request and decides whether it may proceed.
    ///
    /// Uses the tier's default store failure policy.
    pub async fn check(
        &self,
        identity: &Identity,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let policy = self.config.failure_policy_for_tier(tier);
        self.check_with_policy(identity, tier, now, policy).await
    }

    /// Counts a request for a named endpoint, using that endpoint's policy.
    pub async fn check_endpoint(
        &self,
        endpoint: &str,
        identity: &Identity,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let policy = self.config.failure_policy_for_endpoint(endpoint, tier);
        self.check_with_policy(identity, tier, now, policy).await
    }

    /// Counts a request and decides whether it may proceed.
    ///
    /// Store failures never escape: they resolve to `Allow` or `Throttle`
    /// according to `policy`.
    pub async fn check_with_policy(
        &self,
        identity: &Identity,
        tier: Tier,
        now: DateTime<Utc>,
        policy: FailurePolicy,
    ) -> RateLimitDecision {
        let identity_key = identity.key();

        match self.evaluate(identity_key.as_str(), tier, now).await {
            Ok(decision) => decision,
            Err(error) => self.failure_decision(identity_key.as_str(), tier, policy, &error),
        }
    }

    /// Bans an identity immediately, escalating from any previous ban.
    pub async fn impose_ban(
        &self,
        identity_key: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<BanRecord> {
        let previous = self
            .store_call("get_ban", self.repository.get_ban(identity_key))
            .await?;

        let offense_count = match previous.as_ref() {
            Some(ban) if self.is_repeat_offense(ban, now) => ban.offense_count.saturating_add(1),
            _ => 1,
        };

        let mut expires_at = now + self.config.ban_duration(offense_count);
        if let Some(ban) = previous.as_ref().filter(|ban| ban.is_active(now)) {
            expires_at = expires_at.max(ban.expires_at);
        }

        let record = BanRecord {
            identity_key: identity_key.to_owned(),
            reason: reason.to_owned(),
            banned_at: now,
            expires_at,
            offense_count,
        };

        self.store_call("put_ban", self.repository.put_ban(record.clone()))
            .await?;

        warn!(
            identity_key = %identity_key,
            offense_count,
            ban_seconds = record.duration().num_seconds(),
            reason = %reason,
            "identity banned"
        );

        Ok(record)
    }

    /// Returns the active ban for an identity, ignoring expired records.
    pub async fn active_ban(
        &self,
        identity_key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<BanRecord>> {
        let ban = self
            .store_call("get_ban", self.repository.get_ban(identity_key))
            .await?;

        Ok(ban.filter(|record| record.is_active(now)))
    }

    /// Returns the stored counters for an identity.
    pub async fn current_window(&self, identity_key: &str) -> AppResult<Option<RateLimitWindow>> {
        self.store_call("get_window", self.repository.get_window(identity_key))
            .await
    }

    /// Removes stale counters and long-expired bans. Storage hygiene only.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let retention = Duration::hours(IDLE_RETENTION_HOURS)
            .max(Duration::seconds(i64::from(self.config.escalation_period_seconds)));
        let removed = self
            .store_call(
                "cleanup_expired",
                self.repository.cleanup_expired(now - retention),
            )
            .await?;

        info!(removed, "rate limit cleanup completed");
        Ok(removed)
    }

    async fn evaluate(
        &self,
        identity_key: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision> {
        let ban = self
            .store_call("get_ban", self.repository.get_ban(identity_key))
            .await?;
        if let Some(ban) = ban.filter(|record| record.is_active(now)) {
            debug!(
                identity_key = %identity_key,
                until = %ban.expires_at,
                "banned identity rejected"
            );
            return Ok(RateLimitDecision::Banned {
                until: ban.expires_at,
            });
        }

        let thresholds = self.config.thresholds_for(tier);
        let window = self
            .store_call(
                "increment_window",
                self.repository.increment_window(identity_key, &thresholds, now),
            )
            .await?;

        if window.count > thresholds.requests_per_window {
            let retry_after_seconds = window.window_retry_after(&thresholds, now);
            return self
                .register_violation(
                    identity_key,
                    1,
                    "window ceiling exceeded",
                    retry_after_seconds,
                    now,
                )
                .await;
        }

        if window.burst_count > thresholds.burst_ceiling {
            if self.config.ban_on_burst {
                let ban = self
                    .impose_ban(identity_key, "burst ceiling exceeded", now)
                    .await?;
                return Ok(RateLimitDecision::Banned {
                    until: ban.expires_at,
                });
            }

            let retry_after_seconds = window.burst_retry_after(&thresholds, now);
            return self
                .register_violation(
                    identity_key,
                    self.config.burst_violation_weight,
                    "burst ceiling exceeded",
                    retry_after_seconds,
                    now,
                )
                .await;
        }

        Ok(RateLimitDecision::Allow)
    }

    async fn register_violation(
        &self,
        identity_key: &str,
        weight: u32,
        reason: &str,
        retry_after_seconds: u64,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitDecision> {
        let violations = self
            .store_call(
                "record_violation",
                self.repository.record_violation(
                    identity_key,
                    weight,
                    self.config.violation_period_seconds,
                    now,
                ),
            )
            .await?;

        debug!(
            identity_key = %identity_key,
            violations,
            reason = %reason,
            retry_after_seconds,
            "rate limit exceeded"
        );

        if violations < self.config.violations_before_ban {
            return Ok(RateLimitDecision::Throttle {
                retry_after_seconds,
            });
        }

        let ban = self
            .impose_ban(
                identity_key,
                format!("{reason}; {violations} violations").as_str(),
                now,
            )
            .await?;
        self.store_call(
            "reset_violations",
            self.repository.reset_violations(identity_key),
        )
        .await?;

        Ok(RateLimitDecision::Banned {
            until: ban.expires_at,
        })
    }

    fn is_repeat_offense(&self, previous: &BanRecord, now: DateTime<Utc>) -> bool {
        let escalation_period =
            Duration::seconds(i64::from(self.config.escalation_period_seconds));
        previous.is_active(now) || now - previous.expires_at < escalation_period
    }

    fn failure_decision(
        &self,
        identity_key: &str,
        tier: Tier,
        policy: FailurePolicy,
        failure: &AppError,
    ) -> RateLimitDecision {
        if failure.is_store_unavailable() {
            warn!(
                identity_key = %identity_key,
                tier = tier.as_str(),
                policy = policy.as_str(),
                error = %failure,
                "rate limit store unavailable"
            );
        } else {
            error!(
                identity_key = %identity_key,
                tier = tier.as_str(),
                policy = policy.as_str(),
                error = %failure,
                "rate limit check failed"
            );
        }

        match policy {
            FailurePolicy::Open => RateLimitDecision::Allow,
            FailurePolicy::Closed => RateLimitDecision::Throttle {
                retry_after_seconds: self.config.store_unavailable_retry_after_seconds,
            },
        }
    }

    async fn store_call<T, F>(&self, operation: &'static str, future: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        with_store_timeout(self.config.store_timeout, operation, future).await
    }
}
