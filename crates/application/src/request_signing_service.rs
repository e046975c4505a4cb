//! HMAC request signing with timestamp and nonce replay protection.
//!
//! Signatures cover a canonical rendering of `{payload, timestamp, nonce}`.
//! Verification checks freshness first, then authenticity, and only then
//! consumes the nonce, so forged requests cannot burn legitimate nonces.

mod config;
mod ports;
mod signing_crypto;


use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{FailurePolicy, SignatureVerification, SignedRequest, canonical_message};

use crate::store_guard::with_store_timeout;

pub use config::{MIN_SECRET_LENGTH, RequestSigningConfig, SigningSecret};
pub use ports::NonceRepository;
pub use signing_crypto::fingerprint;

use signing_crypto::{compute_signature, generate_nonce, is_well_formed_nonce, signature_matches};

/// Application service for signing and verifying requests.
#[derive(Clone)]
pub struct RequestSigningService {
    nonce_repository: Arc<dyn NonceRepository>,
    config: Arc<RequestSigningConfig>,
}

impl RequestSigningService {
    /// Creates a new request signing service.
    #[must_use]
    pub fn new(nonce_repository: Arc<dyn NonceRepository>, config: RequestSigningConfig) -> Self {
        Self {
            nonce_repository,
            config: Arc::new(config),
        }
    }

    /// Signs a payload at `now` with a fresh random nonce.
    pub fn sign(
        &self,
        payload: Value,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> AppResult<SignedRequest> {
        let timestamp = now.timestamp();
        let nonce = generate_nonce()?;
        let signature = compute_signature(
            secret,
            canonical_message(&payload, timestamp, nonce.as_str()).as_slice(),
        )?;

        Ok(SignedRequest {
            payload,
            timestamp,
            nonce,
            signature,
        })
    }

    /// Signs a payload with a configured partner secret.
    pub fn sign_for_partner(
        &self,
        partner_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> AppResult<SignedRequest> {
        let secret = self.config.partner_secrets.get(partner_id).ok_or_else(|| {
            AppError::NotFound(format!("no signing secret configured for '{partner_id}'"))
        })?;

        self.sign(payload, secret.expose(), now)
    }

    /// Verifies a signed request and consumes its nonce on success.
    pub async fn verify(
        &self,
        request: &SignedRequest,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> SignatureVerification {
        self.verify_scoped(None, request, secret, now).await
    }

    /// Verifies a request signed with a configured partner secret.
    ///
    /// Unknown partners are rejected as [`SignatureVerification::InvalidSignature`].
    /// Nonces are scoped per partner.
    pub async fn verify_for_partner(
        &self,
        partner_id: &str,
        request: &SignedRequest,
        now: DateTime<Utc>,
    ) -> SignatureVerification {
        let Some(secret) = self.config.partner_secrets.get(partner_id) else {
            debug!(partner_id = %partner_id, "signature from unknown partner rejected");
            return SignatureVerification::InvalidSignature;
        };

        self.verify_scoped(Some(partner_id), request, secret.expose(), now).await
    }

    /// Returns whether a nonce is currently recorded as consumed.
    pub async fn nonce_consumed(&self, nonce: &str, now: DateTime<Utc>) -> AppResult<bool> {
        with_store_timeout(
            self.config.store_timeout,
            "is_nonce_consumed",
            self.nonce_repository.is_nonce_consumed(nonce, now),
        )
        .await
    }

    /// Removes expired nonces. Storage hygiene only.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> AppResult<u64> {
        with_store_timeout(
            self.config.store_timeout,
            "cleanup_expired_nonces",
            self.nonce_repository.cleanup_expired(now),
        )
        .await
    }

    async fn verify_scoped(
        &self,
        scope: Option<&str>,
        request: &SignedRequest,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> SignatureVerification {
        let skew = now.timestamp().abs_diff(request.timestamp);
        if skew > u64::from(self.config.allowed_skew_seconds) {
            debug!(skew_seconds = skew, "signed request outside allowed skew");
            return SignatureVerification::Expired;
        }

        if !is_well_formed_nonce(request.nonce.as_str())
            || !signature_matches(
                secret,
                request.canonical_message().as_slice(),
                request.signature.as_str(),
            )
        {
            debug!("signed request failed signature check");
            return SignatureVerification::InvalidSignature;
        }

        let nonce_key = match scope {
            Some(scope) => format!("{scope}:{}", request.nonce),
            None => request.nonce.clone(),
        };
        let expires_at = self.nonce_expiry(request.timestamp, now);

        let consumed = with_store_timeout(
            self.config.store_timeout,
            "consume_nonce",
            self.nonce_repository.consume_nonce(nonce_key.as_str(), expires_at, now),
        )
        .await;

        match consumed {
            Ok(true) => SignatureVerification::Valid,
            Ok(false) => {
                warn!(nonce = %nonce_key, "replayed signed request rejected");
                SignatureVerification::ReplayDetected
            }
            Err(error) => {
                warn!(
                    policy = self.config.failure_policy.as_str(),
                    error = %error,
                    "nonce store unavailable"
                );
                match self.config.failure_policy {
                    FailurePolicy::Open => SignatureVerification::Valid,
                    FailurePolicy::Closed => SignatureVerification::StoreUnavailable,
                }
            }
        }
    }

    fn nonce_expiry(&self, timestamp: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        let replay_expiry = now + Duration::seconds(i64::from(self.config.replay_window_seconds));
        let skew_expiry = DateTime::from_timestamp(timestamp, 0)
            .map(|signed_at| {
                signed_at + Duration::seconds(i64::from(self.config.allowed_skew_seconds))
            })
            .unwrap_or(replay_expiry);

        replay_expiry.max(skew_expiry)
    }
}
