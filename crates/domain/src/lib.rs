//! Domain entities and invariants for request security.

#![forbid(unsafe_code)]

mod identity;
mod rate_limit;
mod signing;
mod threat;

pub use identity::{Identity, Tier};
pub use rate_limit::{
    BanRecord, FailurePolicy, RateLimitDecision, RateLimitWindow, TierThresholds,
};
pub use signing::{SignatureVerification, SignedRequest, canonical_json, canonical_message};
pub use threat::{
    AttackType, AuthOutcome, RequestEvent, ThreatAction, ThreatAssessment, ThreatEvent,
    ThreatEventQuery, ThreatSeverity, ThreatStatus,
};
