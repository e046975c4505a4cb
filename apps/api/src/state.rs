use std::sync::Arc;

use fleetguard_application::{
    Clock, RateLimitService, RequestSigningService, ThreatDetectionService,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub rate_limit_service: RateLimitService,
    pub request_signing_service: RequestSigningService,
    pub threat_detection_service: ThreatDetectionService,
    pub clock: Arc<dyn Clock>,
    pub admin_api_token: Option<Arc<str>>,
    pub trust_gateway_headers: bool,
}
