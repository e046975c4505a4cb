//! Rules driven by running traffic statistics rather than payload content.

use serde_json::json;

use fleetguard_domain::{AttackType, RequestEvent};

use super::config::ThreatDetectionConfig;
use super::rules::{DetectionRule, RuleFinding, combine_weights};
use super::statistics::TrafficSnapshot;

/// Confidence when an identity appears from a geography it never used.
const NEW_GEOGRAPHY_CONFIDENCE: f64 = 0.6;

/// Flags identities whose request velocity exceeds their learned baseline.
pub struct VelocityRule {
    multiplier: f64,
}

impl VelocityRule {
    /// Creates the rule from detection configuration.
    #[must_use]
    pub fn new(config: &ThreatDetectionConfig) -> Self {
        Self {
            multiplier: config.velocity_multiplier,
        }
    }
}

impl DetectionRule for VelocityRule {
    fn name(&self) -> &'static str {
        "ddos"
    }

    fn attack_type(&self) -> AttackType {
        AttackType::Ddos
    }

    fn evaluate(&self, _event: &RequestEvent, traffic: &TrafficSnapshot) -> Option<RuleFinding> {
        let velocity = traffic.velocity?;
        let ceiling = velocity.baseline * self.multiplier;
        let count = f64::from(velocity.count);
        if count <= ceiling {
            return None;
        }

        let ratio = count / ceiling;
        Some(RuleFinding {
            attack_type: AttackType::Ddos,
            confidence: (0.5 + 0.25 * (ratio - 1.0)).min(1.0),
            evidence: json!({
                "requests_in_window": velocity.count,
                "baseline": velocity.baseline,
                "multiplier": self.multiplier,
            }),
        })
    }
}

/// Flags network origins failing authentication across many identities.
pub struct CredentialStuffingRule {
    min_failures: u32,
    min_identities: u32,
}

impl CredentialStuffingRule {
    /// Creates the rule from detection configuration.
    #[must_use]
    pub fn new(config: &ThreatDetectionConfig) -> Self {
        Self {
            min_failures: config.credential_min_failures,
            min_identities: config.credential_min_identities,
        }
    }
}

impl DetectionRule for CredentialStuffingRule {
    fn name(&self) -> &'static str {
        "credential_stuffing"
    }

    fn attack_type(&self) -> AttackType {
        AttackType::CredentialStuffing
    }

    fn evaluate(&self, event: &RequestEvent, traffic: &TrafficSnapshot) -> Option<RuleFinding> {
        let failures = traffic.origin_failures?;
        if failures.failures < self.min_failures
            || failures.distinct_identities < self.min_identities
        {
            return None;
        }

        let spread = f64::from(failures.distinct_identities) / f64::from(failures.failures.max(1));
        Some(RuleFinding {
            attack_type: AttackType::CredentialStuffing,
            confidence: (0.5 + 0.5 * spread).min(1.0),
            evidence: json!({
                "origin": event.origin,
                "failures": failures.failures,
                "distinct_identities": failures.distinct_identities,
            }),
        })
    }
}

/// Flags deviations from an identity's established access pattern.
pub struct BehavioralRule {
    min_history: u64,
    fanout_threshold: u32,
}

impl BehavioralRule {
    /// Creates the rule from detection configuration.
    #[must_use]
    pub fn new(config: &ThreatDetectionConfig) -> Self {
        Self {
            min_history: config.behavioral_min_history,
            fanout_threshold: config.fanout_threshold,
        }
    }
}

impl DetectionRule for BehavioralRule {
    fn name(&self) -> &'static str {
        "behavioral"
    }

    fn attack_type(&self) -> AttackType {
        AttackType::Behavioral
    }

    fn evaluate(&self, event: &RequestEvent, traffic: &TrafficSnapshot) -> Option<RuleFinding> {
        let history = traffic.history?;
        if history.observations < self.min_history {
            return None;
        }

        let mut signals = Vec::new();
        let mut weights = Vec::new();

        if history.geo_is_new {
            signals.push("new_geography");
            weights.push(NEW_GEOGRAPHY_CONFIDENCE);
        }

        if history.distinct_recent_paths > self.fanout_threshold {
            let excess = f64::from(history.distinct_recent_paths - self.fanout_threshold)
                / f64::from(self.fanout_threshold.max(1));
            signals.push("endpoint_fanout");
            weights.push((0.5 + 0.3 * excess).min(0.9));
        }

        if signals.is_empty() {
            return None;
        }

        Some(RuleFinding {
            attack_type: AttackType::Behavioral,
            confidence: combine_weights(weights),
            evidence: json!({
                "signals": signals,
                "geo": event.geo,
                "distinct_recent_paths": history.distinct_recent_paths,
                "observations": history.observations,
            }),
        })
    }
}
