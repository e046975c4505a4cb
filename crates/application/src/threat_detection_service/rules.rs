use serde_json::Value;

use fleetguard_domain::{AttackType, RequestEvent};

use super::statistics::TrafficSnapshot;

/// One rule's verdict for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFinding {
    /// Attack the rule recognized.
    pub attack_type: AttackType,
    /// Raw confidence in `[0, 1]`, before completeness degradation.
    pub confidence: f64,
    /// Rule-specific evidence kept with the threat event.
    pub evidence: Value,
}

/// Independent, pluggable classifier evaluated for every request event.
///
/// Rules are pure with respect to the event and the traffic snapshot so they
/// can be tested and toggled one at a time.
pub trait DetectionRule: Send + Sync {
    /// Stable rule name used for toggling and evidence.
    fn name(&self) -> &'static str;

    /// Attack type this rule reports.
    fn attack_type(&self) -> AttackType;

    /// Returns a finding when the event matches.
    fn evaluate(&self, event: &RequestEvent, traffic: &TrafficSnapshot) -> Option<RuleFinding>;
}

/// Combines independent match weights: `1 - prod(1 - weight)`.
#[must_use]
pub fn combine_weights(weights: impl IntoIterator<Item = f64>) -> f64 {
    let miss = weights
        .into_iter()
        .fold(1.0_f64, |miss, weight| miss * (1.0 - weight.clamp(0.0, 1.0)));

    (1.0 - miss).clamp(0.0, 1.0)
}
