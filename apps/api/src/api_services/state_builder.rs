use std::sync::Arc;

use fleetguard_application::{
    NonceRepository, RateLimitRepository, RateLimitService, RequestSigningService,
    ThreatDetectionService, ThreatEventRepository,
};
use fleetguard_core::AppError;
use fleetguard_infrastructure::{
    InMemorySecurityStore, PostgresNonceRepository, PostgresRateLimitRepository,
    PostgresThreatEventRepository, RedisNonceRepository, RedisRateLimitRepository, SystemClock,
};
use sqlx::PgPool;
use tracing::info;

use super::build_redis_client;
use crate::api_config::{ApiConfig, SecurityStoreKind};
use crate::state::AppState;

const REDIS_KEY_PREFIX: &str = "fleetguard";

struct SecurityRepositories {
    rate_limit: Arc<dyn RateLimitRepository>,
    nonces: Arc<dyn NonceRepository>,
    threat_events: Arc<dyn ThreatEventRepository>,
}

pub fn build_app_state(config: &ApiConfig, pool: Option<PgPool>) -> Result<AppState, AppError> {
    let repositories = build_repositories(config, pool)?;
    let security = config.security.clone();

    let rate_limit_service =
        RateLimitService::new(repositories.rate_limit, security.rate_limit);
    let request_signing_service = RequestSigningService::new(repositories.nonces, security.signing);
    let threat_detection_service =
        ThreatDetectionService::new(repositories.threat_events, security.detection)?
            .with_rate_limit_feedback(rate_limit_service.clone());

    info!(
        store = ?config.store_kind,
        rules = ?threat_detection_service.rule_names(),
        "security services initialized"
    );

    Ok(AppState {
        rate_limit_service,
        request_signing_service,
        threat_detection_service,
        clock: Arc::new(SystemClock),
        admin_api_token: config.admin_api_token.as_deref().map(Arc::from),
        trust_gateway_headers: config.trust_gateway_headers,
    })
}

fn build_repositories(
    config: &ApiConfig,
    pool: Option<PgPool>,
) -> Result<SecurityRepositories, AppError> {
    if config.store_kind == SecurityStoreKind::Memory {
        let store = Arc::new(InMemorySecurityStore::new());
        return Ok(SecurityRepositories {
            rate_limit: store.clone(),
            nonces: store.clone(),
            threat_events: store,
        });
    }

    let pool = pool.ok_or_else(|| {
        AppError::Validation(format!(
            "DATABASE_URL is required for the {:?} store",
            config.store_kind
        ))
    })?;
    let threat_events = Arc::new(PostgresThreatEventRepository::new(pool.clone()));

    if config.store_kind == SecurityStoreKind::Redis {
        let redis_url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| AppError::Validation("REDIS_URL is required".to_owned()))?;
        let client = build_redis_client(redis_url)?;
        let rate_limit = RedisRateLimitRepository::new(client.clone(), REDIS_KEY_PREFIX)
            .with_ban_retention(config.security.rate_limit.escalation_period_seconds);

        return Ok(SecurityRepositories {
            rate_limit: Arc::new(rate_limit),
            nonces: Arc::new(RedisNonceRepository::new(client, REDIS_KEY_PREFIX)),
            threat_events,
        });
    }

    Ok(SecurityRepositories {
        rate_limit: Arc::new(PostgresRateLimitRepository::new(pool.clone())),
        nonces: Arc::new(PostgresNonceRepository::new(pool)),
        threat_events,
    })
}
