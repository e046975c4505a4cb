//! Caller identities and the tiers that select their thresholds.

use std::net::IpAddr;
use std::str::FromStr;

use fleetguard_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters of the API key digest kept in storage keys.
const API_KEY_DIGEST_PREFIX: usize = 24;

/// Composite key scoping rate limiting, signing, and detection.
///
/// Resolved once per request before any security check runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// Authenticated marketplace user.
    User {
        /// Stable user identifier.
        user_id: NonEmptyString,
    },
    /// Partner or integration API key.
    ApiKey {
        /// Raw API key as presented by the caller.
        api_key: NonEmptyString,
    },
    /// Anonymous caller identified by network address and client fingerprint.
    Network {
        /// Caller IP address.
        ip: IpAddr,
        /// Client fingerprint, usually a user-agent digest.
        fingerprint: String,
    },
}

impl Identity {
    /// Creates a user identity.
    pub fn user(user_id: impl Into<String>) -> AppResult<Self> {
        Ok(Self::User {
            user_id: NonEmptyString::new(user_id)?,
        })
    }

    /// Creates an API key identity.
    pub fn api_key(api_key: impl Into<String>) -> AppResult<Self> {
        Ok(Self::ApiKey {
            api_key: NonEmptyString::new(api_key)?,
        })
    }

    /// Creates a network identity.
    #[must_use]
    pub fn network(ip: IpAddr, fingerprint: impl Into<String>) -> Self {
        Self::Network {
            ip,
            fingerprint: fingerprint.into(),
        }
    }

    /// Returns the stable storage key for this identity.
    ///
    /// API keys are digested so raw secrets never reach the store.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::User { user_id } => format!("user:{user_id}"),
            Self::ApiKey { api_key } => {
                let digest = hex::encode(Sha256::digest(api_key.as_str().as_bytes()));
                format!("api_key:{}", &digest[..API_KEY_DIGEST_PREFIX])
            }
            Self::Network { ip, fingerprint } if fingerprint.is_empty() => format!("net:{ip}"),
            Self::Network { ip, fingerprint } => format!("net:{ip}:{fingerprint}"),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.key().as_str())
    }
}

/// Named category selecting a threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Anonymous or unverified callers.
    Basic,
    /// Regular signed-in customers and hosts.
    Standard,
    /// Fleet operators and paying partners.
    Premium,
    /// Fleet console administrators.
    Admin,
}

impl Tier {
    /// Returns a stable storage value for this tier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Admin => "admin",
        }
    }

    /// Returns all known tiers.
    #[must_use]
    pub fn all() -> &'static [Self] {
        const ALL: &[Tier] = &[Tier::Basic, Tier::Standard, Tier::Premium, Tier::Admin];

        ALL
    }
}

impl FromStr for Tier {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            "admin" => Ok(Self::Admin),
            _ => Err(AppError::Validation(format!("unknown tier value '{value}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;

    use super::{Identity, Tier};

    #[test]
    fn api_key_identity_never_exposes_raw_key() {
        let identity = Identity::api_key("sk_live_partner_secret");
        assert!(identity.is_ok());
        let key = identity.map(|value| value.key()).unwrap_or_default();
        assert!(key.starts_with("api_key:"));
        assert!(!key.contains("sk_live_partner_secret"));
    }

    #[test]
    fn network_identity_includes_fingerprint() {
        let identity = Identity::network(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), "ab12");
        assert_eq!(identity.key(), "net:10.0.0.7:ab12");

        let bare = Identity::network(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), "");
        assert_eq!(bare.key(), "net:10.0.0.7");
    }

    #[test]
    fn empty_user_identity_is_rejected() {
        assert!(Identity::user("  ").is_err());
    }

    #[test]
    fn tier_roundtrip_storage_value() {
        for tier in Tier::all() {
            let restored = Tier::from_str(tier.as_str());
            assert_eq!(restored.ok(), Some(*tier));
        }
        assert!(Tier::from_str("platinum").is_err());
    }
}
