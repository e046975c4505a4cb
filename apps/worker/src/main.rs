//! Fleetguard storage hygiene worker.
//!
//! Periodically prunes stale rate limit windows, expired bans and consumed
//! nonces. Correctness never depends on this job: every expiry is also
//! enforced at read time.

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetguard_application::{
    Clock, NonceRepository, RateLimitConfig, RateLimitRepository, RateLimitService,
    RequestSigningConfig, RequestSigningService,
};
use fleetguard_core::{AppError, AppResult};
use fleetguard_infrastructure::{
    PostgresNonceRepository, PostgresRateLimitRepository, RedisNonceRepository,
    RedisRateLimitRepository, SystemClock,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const REDIS_KEY_PREFIX: &str = "fleetguard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupStore {
    Postgres,
    Redis,
}

#[derive(Clone)]
struct WorkerConfig {
    store: CleanupStore,
    database_url: Option<String>,
    redis_url: Option<String>,
    cleanup_interval_seconds: u64,
    store_timeout_ms: u64,
}

/// Rows or keys removed by one cleanup pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CleanupReport {
    rate_limit_records: u64,
    nonces: u64,
    failures: u32,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let (rate_limit_service, request_signing_service) = build_services(&config).await?;
    let clock = SystemClock;

    info!(
        store = ?config.store,
        cleanup_interval_seconds = config.cleanup_interval_seconds,
        "fleetguard-worker started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.cleanup_interval_seconds));
    loop {
        interval.tick().await;

        let report =
            run_cleanup_cycle(&rate_limit_service, &request_signing_service, clock.now()).await;
        info!(
            rate_limit_records = report.rate_limit_records,
            nonces = report.nonces,
            failures = report.failures,
            "cleanup cycle completed"
        );
    }
}

/// Runs one pass over every store. A failing store is logged and skipped.
async fn run_cleanup_cycle(
    rate_limit_service: &RateLimitService,
    request_signing_service: &RequestSigningService,
    now: DateTime<Utc>,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    match rate_limit_service.cleanup(now).await {
        Ok(removed) => report.rate_limit_records = removed,
        Err(error) => {
            report.failures += 1;
            warn!(error = %error, "rate limit cleanup failed");
        }
    }

    match request_signing_service.cleanup(now).await {
        Ok(removed) => report.nonces = removed,
        Err(error) => {
            report.failures += 1;
            warn!(error = %error, "nonce cleanup failed");
        }
    }

    report
}

async fn build_services(
    config: &WorkerConfig,
) -> AppResult<(RateLimitService, RequestSigningService)> {
    let rate_limit_config = RateLimitConfig {
        store_timeout: Duration::from_millis(config.store_timeout_ms),
        ..RateLimitConfig::default()
    };
    let signing_config = RequestSigningConfig {
        store_timeout: Duration::from_millis(config.store_timeout_ms),
        ..RequestSigningConfig::default()
    };

    let (rate_limit_repository, nonce_repository): (
        Arc<dyn RateLimitRepository>,
        Arc<dyn NonceRepository>,
    ) = match config.store {
        CleanupStore::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| AppError::Validation("DATABASE_URL is required".to_owned()))?;
            let pool = connect_pool(database_url).await?;
            (
                Arc::new(PostgresRateLimitRepository::new(pool.clone())),
                Arc::new(PostgresNonceRepository::new(pool)),
            )
        }
        CleanupStore::Redis => {
            let redis_url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| AppError::Validation("REDIS_URL is required".to_owned()))?;
            let client = redis::Client::open(redis_url)
                .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))?;
            (
                Arc::new(RedisRateLimitRepository::new(client.clone(), REDIS_KEY_PREFIX)),
                Arc::new(RedisNonceRepository::new(client, REDIS_KEY_PREFIX)),
            )
        }
    };

    Ok((
        RateLimitService::new(rate_limit_repository, rate_limit_config),
        RequestSigningService::new(nonce_repository, signing_config),
    ))
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let store = match env::var("RATE_LIMIT_STORE")
            .unwrap_or_else(|_| "postgres".to_owned())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" => CleanupStore::Postgres,
            "redis" => CleanupStore::Redis,
            "memory" => {
                return Err(AppError::Validation(
                    "the memory store lives inside the API process; nothing to clean".to_owned(),
                ));
            }
            other => {
                return Err(AppError::Validation(format!(
                    "RATE_LIMIT_STORE must be 'postgres' or 'redis', got '{other}'"
                )));
            }
        };

        let database_url = match store {
            CleanupStore::Postgres => Some(required_env("DATABASE_URL")?),
            CleanupStore::Redis => None,
        };
        let redis_url = match store {
            CleanupStore::Redis => Some(required_env("REDIS_URL")?),
            CleanupStore::Postgres => None,
        };
        let cleanup_interval_seconds = parse_env_u64("CLEANUP_INTERVAL_SECONDS", 300)?;
        let store_timeout_ms = parse_env_u64("STORE_TIMEOUT_MS", 2_000)?;

        if cleanup_interval_seconds == 0 {
            return Err(AppError::Validation(
                "CLEANUP_INTERVAL_SECONDS must be greater than zero".to_owned(),
            ));
        }

        if store_timeout_ms == 0 {
            return Err(AppError::Validation(
                "STORE_TIMEOUT_MS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            store,
            database_url,
            redis_url,
            cleanup_interval_seconds,
            store_timeout_ms,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
