use std::collections::HashMap;
use std::time::Duration;

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::FailurePolicy;

/// Minimum accepted length of a partner secret, in bytes.
pub const MIN_SECRET_LENGTH: usize = 16;

/// HMAC key material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    /// Creates a secret, rejecting short keys.
    pub fn new(value: impl Into<Vec<u8>>) -> AppResult<Self> {
        let value = value.into();
        if value.len() < MIN_SECRET_LENGTH {
            return Err(AppError::Validation(format!(
                "signing secrets must be at least {MIN_SECRET_LENGTH} bytes"
            )));
        }

        Ok(Self(value))
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("SigningSecret(**redacted**)")
    }
}

/// Static request signing configuration loaded at startup.
#[derive(Debug, Clone)]
pub struct RequestSigningConfig {
    /// Maximum distance between a request timestamp and the verifier clock.
    pub allowed_skew_seconds: u32,
    /// Minimum time a consumed nonce is remembered.
    pub replay_window_seconds: u32,
    /// Behavior when the nonce store fails.
    pub failure_policy: FailurePolicy,
    /// Upper bound on every store call.
    pub store_timeout: Duration,
    /// Secrets keyed by partner identifier.
    pub partner_secrets: HashMap<String, SigningSecret>,
}

impl Default for RequestSigningConfig {
    fn default() -> Self {
        Self {
            allowed_skew_seconds: 5 * 60,
            replay_window_seconds: 10 * 60,
            failure_policy: FailurePolicy::Closed,
            store_timeout: Duration::from_millis(250),
            partner_secrets: HashMap::new(),
        }
    }
}

impl RequestSigningConfig {
    /// Validates cross-field constraints.
    pub fn validate(&self) -> AppResult<()> {
        if self.allowed_skew_seconds == 0 {
            return Err(AppError::Validation(
                "allowed_skew_seconds must be greater than zero".to_owned(),
            ));
        }

        if self.replay_window_seconds < self.allowed_skew_seconds {
            return Err(AppError::Validation(format!(
                "replay window ({}s) must cover the allowed skew ({}s)",
                self.replay_window_seconds, self.allowed_skew_seconds
            )));
        }

        Ok(())
    }

    /// Parses a `partner:secret,partner:secret` keyring.
    pub fn parse_partner_secrets(value: &str) -> AppResult<HashMap<String, SigningSecret>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (partner_id, secret) = entry.split_once(':').ok_or_else(|| {
                    AppError::Validation(
                        "partner secrets must look like 'partner:secret'".to_owned(),
                    )
                })?;
                let partner_id = partner_id.trim();
                if partner_id.is_empty() {
                    return Err(AppError::Validation(
                        "partner identifier must not be empty".to_owned(),
                    ));
                }

                Ok((
                    partner_id.to_owned(),
                    SigningSecret::new(secret.trim().as_bytes())?,
                ))
            })
            .collect()
    }
}
