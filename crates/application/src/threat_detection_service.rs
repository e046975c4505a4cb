//! Rule-based anomaly detection over inbound request events.
//!
//! Each rule scores an event independently. The strongest finding decides
//! the action: critical threats are blocked and banned, high and medium ones
//! are flagged for review, low ones are only logged.

mod config;
mod ports;
mod rules;
mod service;
mod severity;
mod signature_rules;
mod statistics;
mod traffic_rules;

#[cfg(test)]
mod tests;

pub use config::{BUILT_IN_RULES, ThreatDetectionConfig};
pub use ports::ThreatEventRepository;
pub use rules::{DetectionRule, RuleFinding, combine_weights};
pub use service::ThreatDetectionService;
pub use severity::classify;
pub use statistics::{FailureSample, HistorySample, TrafficSnapshot, VelocitySample};
