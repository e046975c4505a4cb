//! Application services and ports for request security.

#![forbid(unsafe_code)]

mod clock;
mod rate_limit_service;
mod request_signing_service;
mod security_config;
mod store_guard;
mod threat_detection_service;

#[cfg(test)]
mod test_support;

pub use clock::Clock;
pub use rate_limit_service::{
    RateLimitConfig, RateLimitRepository, RateLimitService, default_thresholds,
};
pub use request_signing_service::{
    MIN_SECRET_LENGTH, NonceRepository, RequestSigningConfig, RequestSigningService,
    SigningSecret, fingerprint,
};
pub use security_config::SecurityConfig;
pub use threat_detection_service::{
    BUILT_IN_RULES, DetectionRule, FailureSample, HistorySample, RuleFinding,
    ThreatDetectionConfig, ThreatDetectionService, ThreatEventRepository, TrafficSnapshot,
    VelocitySample, classify, combine_weights,
};
