use std::collections::HashMap;
use std::time::Duration;

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{FailurePolicy, Tier, TierThresholds};

/// Static rate limiting configuration loaded at startup.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Threshold table per tier. Missing tiers fall back to built-in defaults.
    pub tiers: HashMap<Tier, TierThresholds>,
    /// Violation weight that triggers a ban.
    pub violations_before_ban: u32,
    /// Rolling period over which violations accumulate.
    pub violation_period_seconds: u32,
    /// Violation weight of a burst breach. Window breaches weigh one.
    pub burst_violation_weight: u32,
    /// Ban immediately on a burst breach instead of throttling.
    pub ban_on_burst: bool,
    /// Duration of a first offense ban.
    pub base_ban_seconds: u32,
    /// Factor applied to the ban duration for each repeat offense.
    pub ban_multiplier: u32,
    /// Upper bound for any ban duration.
    pub max_ban_seconds: u32,
    /// How long after a ban expires a new ban still counts as a repeat.
    pub escalation_period_seconds: u32,
    /// Policy when the store fails, for tiers and endpoints without an override.
    pub default_failure_policy: FailurePolicy,
    /// Explicit per-endpoint failure policies.
    pub endpoint_failure_policies: HashMap<String, FailurePolicy>,
    /// Retry delay reported when failing closed.
    pub store_unavailable_retry_after_seconds: u64,
    /// Upper bound on every store call.
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: Tier::all()
                .iter()
                .map(|tier| (*tier, default_thresholds(*tier)))
                .collect(),
            violations_before_ban: 5,
            violation_period_seconds: 10 * 60,
            burst_violation_weight: 2,
            ban_on_burst: false,
            base_ban_seconds: 5 * 60,
            ban_multiplier: 2,
            max_ban_seconds: 24 * 60 * 60,
            escalation_period_seconds: 24 * 60 * 60,
            default_failure_policy: FailurePolicy::Open,
            endpoint_failure_policies: HashMap::new(),
            store_unavailable_retry_after_seconds: 30,
            store_timeout: Duration::from_millis(250),
        }
    }
}

impl RateLimitConfig {
    /// Validates cross-field constraints.
    pub fn validate(&self) -> AppResult<()> {
        if self.violations_before_ban == 0 {
            return Err(AppError::Validation(
                "violations_before_ban must be greater than zero".to_owned(),
            ));
        }

        if self.base_ban_seconds == 0 || self.base_ban_seconds > self.max_ban_seconds {
            return Err(AppError::Validation(format!(
                "base ban ({}s) must be positive and not exceed the maximum ({}s)",
                self.base_ban_seconds, self.max_ban_seconds
            )));
        }

        if self.ban_multiplier < 2 {
            return Err(AppError::Validation(
                "ban_multiplier must be at least 2 so repeat bans grow".to_owned(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(AppError::Validation(
                "store timeout must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns the thresholds applied to a tier.
    #[must_use]
    pub fn thresholds_for(&self, tier: Tier) -> TierThresholds {
        self.tiers
            .get(&tier)
            .copied()
            .unwrap_or_else(|| default_thresholds(tier))
    }

    /// Returns the store failure policy for a tier.
    ///
    /// Admin traffic always fails closed.
    #[must_use]
    pub fn failure_policy_for_tier(&self, tier: Tier) -> FailurePolicy {
        match tier {
            Tier::Admin => FailurePolicy::Closed,
            _ => self.default_failure_policy,
        }
    }

    /// Returns the store failure policy for a named endpoint.
    ///
    /// An explicit endpoint entry wins over the tier default.
    #[must_use]
    pub fn failure_policy_for_endpoint(&self, endpoint: &str, tier: Tier) -> FailurePolicy {
        self.endpoint_failure_policies
            .get(endpoint)
            .copied()
            .unwrap_or_else(|| self.failure_policy_for_tier(tier))
    }

    /// Returns the ban length for the given offense number (starting at one).
    #[must_use]
    pub fn ban_duration(&self, offense_count: u32) -> chrono::Duration {
        let exponent = offense_count.saturating_sub(1);
        let seconds = self
            .ban_multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.base_ban_seconds.checked_mul(factor))
            .unwrap_or(self.max_ban_seconds)
            .min(self.max_ban_seconds);

        chrono::Duration::seconds(i64::from(seconds))
    }
}

/// Built-in thresholds per tier.
#[must_use]
pub fn default_thresholds(tier: Tier) -> TierThresholds {
    let (requests_per_window, burst_ceiling) = match tier {
        Tier::Basic => (60, 10),
        Tier::Standard => (100, 10),
        Tier::Premium => (300, 30),
        Tier::Admin => (1_000, 100),
    };

    TierThresholds {
        requests_per_window,
        window_seconds: 60,
        burst_ceiling,
        burst_window_seconds: 5,
    }
}
