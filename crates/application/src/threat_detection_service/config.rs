use std::collections::BTreeSet;
use std::time::Duration;

use fleetguard_core::{AppError, AppResult};

/// Names of the built-in detection rules, in evaluation order.
pub const BUILT_IN_RULES: &[&str] = &["sqli", "xss", "ddos", "credential_stuffing", "behavioral"];

/// Static anomaly detection configuration loaded at startup.
#[derive(Debug, Clone)]
pub struct ThreatDetectionConfig {
    /// Rules switched off by name.
    pub disabled_rules: BTreeSet<String>,
    /// Sliding window used to measure request velocity.
    pub velocity_window_seconds: u32,
    /// Velocity above `baseline * multiplier` is a flood.
    pub velocity_multiplier: f64,
    /// Floor for the learned per-identity baseline.
    pub velocity_min_baseline: f64,
    /// EWMA weight given to each completed velocity window.
    pub baseline_smoothing: f64,
    /// Window over which authentication failures per origin are counted.
    pub credential_window_seconds: u32,
    /// Failures per origin required before stuffing is considered.
    pub credential_min_failures: u32,
    /// Distinct identities among those failures required for stuffing.
    pub credential_min_identities: u32,
    /// Observations needed before behavioral deviation is judged.
    pub behavioral_min_history: u64,
    /// Window over which distinct endpoints per identity are counted.
    pub fanout_window_seconds: u32,
    /// Distinct endpoints per fan-out window considered normal.
    pub fanout_threshold: u32,
    /// Maximum identities and origins held in the statistics cache.
    pub max_tracked_keys: usize,
    /// Idle time after which a cached profile is dropped.
    pub idle_ttl_seconds: u32,
    /// Longest prefix of any inspected text, in bytes.
    pub max_inspected_bytes: usize,
    /// Upper bound on every store call.
    pub store_timeout: Duration,
}

impl Default for ThreatDetectionConfig {
    fn default() -> Self {
        Self {
            disabled_rules: BTreeSet::new(),
            velocity_window_seconds: 10,
            velocity_multiplier: 3.0,
            velocity_min_baseline: 20.0,
            baseline_smoothing: 0.2,
            credential_window_seconds: 5 * 60,
            credential_min_failures: 10,
            credential_min_identities: 5,
            behavioral_min_history: 20,
            fanout_window_seconds: 60,
            fanout_threshold: 25,
            max_tracked_keys: 50_000,
            idle_ttl_seconds: 60 * 60,
            max_inspected_bytes: 64 * 1024,
            store_timeout: Duration::from_millis(250),
        }
    }
}

impl ThreatDetectionConfig {
    /// Validates cross-field constraints.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(unknown) = self
            .disabled_rules
            .iter()
            .find(|name| !BUILT_IN_RULES.contains(&name.as_str()))
        {
            return Err(AppError::Validation(format!(
                "unknown detection rule '{unknown}'"
            )));
        }

        if self.velocity_multiplier <= 1.0 {
            return Err(AppError::Validation(
                "velocity_multiplier must be greater than one".to_owned(),
            ));
        }

        if !(0.0..=1.0).contains(&self.baseline_smoothing) || self.baseline_smoothing == 0.0 {
            return Err(AppError::Validation(
                "baseline_smoothing must be in (0, 1]".to_owned(),
            ));
        }

        if self.velocity_window_seconds == 0
            || self.credential_window_seconds == 0
            || self.fanout_window_seconds == 0
        {
            return Err(AppError::Validation(
                "detection windows must be greater than zero".to_owned(),
            ));
        }

        if self.max_tracked_keys == 0 {
            return Err(AppError::Validation(
                "max_tracked_keys must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns whether a rule runs.
    #[must_use]
    pub fn is_rule_enabled(&self, name: &str) -> bool {
        !self.disabled_rules.contains(name)
    }

    /// Parses a comma-separated list of rule names.
    pub fn parse_rule_names(value: &str) -> AppResult<BTreeSet<String>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                let name = name.to_ascii_lowercase();
                if BUILT_IN_RULES.contains(&name.as_str()) {
                    Ok(name)
                } else {
                    Err(AppError::Validation(format!(
                        "unknown detection rule '{name}'"
                    )))
                }
            })
            .collect()
    }
}
