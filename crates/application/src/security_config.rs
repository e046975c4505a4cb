use std::time::Duration;

use fleetguard_core::AppResult;

use crate::{RateLimitConfig, RequestSigningConfig, ThreatDetectionConfig};

/// Configuration for every security service, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Request signer settings.
    pub signing: RequestSigningConfig,
    /// Anomaly detector settings.
    pub detection: ThreatDetectionConfig,
}

impl SecurityConfig {
    /// Validates every section.
    pub fn validate(&self) -> AppResult<()> {
        self.rate_limit.validate()?;
        self.signing.validate()?;
        self.detection.validate()
    }

    /// Applies one store timeout to every service.
    #[must_use]
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.rate_limit.store_timeout = store_timeout;
        self.signing.store_timeout = store_timeout;
        self.detection.store_timeout = store_timeout;
        self
    }
}
