use chrono::{DateTime, Utc};
use fleetguard_domain::{BanRecord, RateLimitWindow};
use serde::Serialize;

/// Health response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Acknowledgement for an accepted partner event.
#[derive(Debug, Serialize)]
pub struct PartnerEventAcceptedResponse {
    pub partner_id: String,
    pub nonce: String,
    pub accepted_at: DateTime<Utc>,
}

/// Stored limiter state for one identity.
#[derive(Debug, Serialize)]
pub struct IdentityRateLimitResponse {
    pub identity_key: String,
    pub window: Option<RateLimitWindow>,
    pub active_ban: Option<BanRecord>,
}
