use std::collections::BTreeMap;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use fleetguard_application::{RequestSigningConfig, SecurityConfig, ThreatDetectionConfig};
use fleetguard_core::AppError;
use fleetguard_domain::{FailurePolicy, Tier, TierThresholds};
use tracing_subscriber::EnvFilter;

const TIER_PREFIX: &str = "RATE_LIMIT_TIER_";
const ENDPOINT_POLICY_PREFIX: &str = "RATE_LIMIT_FAILURE_POLICY_";

/// Backing store for rate limit counters and nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStoreKind {
    /// Postgres tables shared by every replica.
    Postgres,
    /// Redis keys with Lua-scripted updates.
    Redis,
    /// Process-local maps for single-node deployments and local runs.
    Memory,
}

impl FromStr for SecurityStoreKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(AppError::Validation(format!(
                "RATE_LIMIT_STORE must be 'postgres', 'redis' or 'memory', got '{other}'"
            ))),
        }
    }
}

/// Runtime settings for the API binary.
///
/// Not `Debug`: it carries the admin token and partner secrets.
#[derive(Clone)]
pub struct ApiConfig {
    pub migrate_only: bool,
    pub store_kind: SecurityStoreKind,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub api_host: String,
    pub api_port: u16,
    pub admin_api_token: Option<String>,
    pub trust_gateway_headers: bool,
    pub security: SecurityConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self, AppError> {
        let migrate_only = env::args().nth(1).as_deref() == Some("migrate");
        let vars: BTreeMap<String, String> = env::vars().collect();

        Self::from_vars(&vars, migrate_only)
    }

    pub fn from_vars(vars: &BTreeMap<String, String>, migrate_only: bool) -> Result<Self, AppError> {
        let store_kind = optional_var(vars, "RATE_LIMIT_STORE")
            .map(SecurityStoreKind::from_str)
            .transpose()?
            .unwrap_or(SecurityStoreKind::Postgres);

        // Threat events live in Postgres unless everything runs in memory.
        let database_url = match store_kind {
            SecurityStoreKind::Memory if !migrate_only => {
                optional_var(vars, "DATABASE_URL").map(str::to_owned)
            }
            _ => Some(required_var(vars, "DATABASE_URL")?),
        };
        let redis_url = match store_kind {
            SecurityStoreKind::Redis => Some(required_var(vars, "REDIS_URL")?),
            _ => optional_var(vars, "REDIS_URL").map(str::to_owned),
        };

        let api_host = optional_var(vars, "API_HOST")
            .unwrap_or("127.0.0.1")
            .to_owned();
        let api_port = optional_var(vars, "API_PORT")
            .map(|value| {
                value
                    .parse::<u16>()
                    .map_err(|error| AppError::Validation(format!("invalid API_PORT: {error}")))
            })
            .transpose()?
            .unwrap_or(3001);

        let admin_api_token = optional_var(vars, "ADMIN_API_TOKEN").map(str::to_owned);
        if admin_api_token
            .as_ref()
            .is_some_and(|token| token.len() < 32)
        {
            return Err(AppError::Validation(
                "ADMIN_API_TOKEN must be at least 32 characters".to_owned(),
            ));
        }

        let trust_gateway_headers = optional_var(vars, "TRUST_GATEWAY_HEADERS")
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));

        Ok(Self {
            migrate_only,
            store_kind,
            database_url,
            redis_url,
            api_host,
            api_port,
            admin_api_token,
            trust_gateway_headers,
            security: security_config_from_vars(vars)?,
        })
    }

    pub fn socket_address(&self) -> Result<SocketAddr, AppError> {
        let host = IpAddr::from_str(&self.api_host).map_err(|error| {
            AppError::Internal(format!("invalid API_HOST '{}': {error}", self.api_host))
        })?;
        Ok(SocketAddr::from((host, self.api_port)))
    }
}

/// Reads tier thresholds, failure policies, partner secrets, disabled rules
/// and the store timeout on top of the built-in defaults.
pub fn security_config_from_vars(
    vars: &BTreeMap<String, String>,
) -> Result<SecurityConfig, AppError> {
    let mut config = SecurityConfig::default();

    for (name, value) in vars {
        if let Some(tier) = name.strip_prefix(TIER_PREFIX) {
            let tier = Tier::from_str(tier)?;
            let thresholds = TierThresholds::parse(value)
                .map_err(|error| AppError::Validation(format!("invalid {name}: {error}")))?;
            config.rate_limit.tiers.insert(tier, thresholds);
        } else if let Some(endpoint) = name.strip_prefix(ENDPOINT_POLICY_PREFIX) {
            let policy = FailurePolicy::from_str(value)?;
            config
                .rate_limit
                .endpoint_failure_policies
                .insert(endpoint.to_ascii_lowercase(), policy);
        }
    }

    if let Some(value) = optional_var(vars, "RATE_LIMIT_FAILURE_POLICY") {
        config.rate_limit.default_failure_policy = FailurePolicy::from_str(value)?;
    }
    if let Some(value) = optional_var(vars, "SIGNING_FAILURE_POLICY") {
        config.signing.failure_policy = FailurePolicy::from_str(value)?;
    }
    if let Some(value) = optional_var(vars, "SIGNING_PARTNER_SECRETS") {
        config.signing.partner_secrets = RequestSigningConfig::parse_partner_secrets(value)?;
    }
    if let Some(value) = optional_var(vars, "THREAT_RULES_DISABLED") {
        config.detection.disabled_rules = ThreatDetectionConfig::parse_rule_names(value)?;
    }
    if let Some(value) = optional_var(vars, "STORE_TIMEOUT_MS") {
        let millis = value
            .parse::<u64>()
            .map_err(|error| AppError::Validation(format!("invalid STORE_TIMEOUT_MS: {error}")))?;
        config = config.with_store_timeout(Duration::from_millis(millis));
    }

    config.validate()?;
    Ok(config)
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_var(vars: &BTreeMap<String, String>, name: &str) -> Result<String, AppError> {
    optional_var(vars, name)
        .map(str::to_owned)
        .ok_or_else(|| AppError::Validation(format!("{name} is required")))
}

fn optional_var<'a>(vars: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}
