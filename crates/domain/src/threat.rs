//! Threat classification, request events, and persisted threat records.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleetguard_core::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Category of a detected attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    /// SQL injection attempt.
    Sqli,
    /// Cross-site scripting attempt.
    Xss,
    /// Request flood from one identity.
    Ddos,
    /// Authentication failures across many identities from one origin.
    CredentialStuffing,
    /// Deviation from an identity's historical access pattern.
    Behavioral,
    /// Anything else worth recording.
    Other,
}

impl AttackType {
    /// Returns a stable storage value for this attack type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqli => "sqli",
            Self::Xss => "xss",
            Self::Ddos => "ddos",
            Self::CredentialStuffing => "credential_stuffing",
            Self::Behavioral => "behavioral",
            Self::Other => "other",
        }
    }
}

impl FromStr for AttackType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sqli" => Ok(Self::Sqli),
            "xss" => Ok(Self::Xss),
            "ddos" => Ok(Self::Ddos),
            "credential_stuffing" => Ok(Self::CredentialStuffing),
            "behavioral" => Ok(Self::Behavioral),
            "other" => Ok(Self::Other),
            _ => Err(AppError::Validation(format!(
                "unknown attack type value '{value}'"
            ))),
        }
    }
}

/// Severity of a threat. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatSeverity {
    /// Logged only.
    Low,
    /// Flagged for review.
    Medium,
    /// Flagged for review with priority.
    High,
    /// Blocked and banned immediately.
    Critical,
}

impl ThreatSeverity {
    /// Returns a stable storage value for this severity.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Returns the numeric rank used for ordering in storage queries.
    #[must_use]
    pub fn rank(&self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl FromStr for ThreatSeverity {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(AppError::Validation(format!(
                "unknown threat severity value '{value}'"
            ))),
        }
    }
}

/// Review lifecycle of a persisted threat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatStatus {
    /// Recorded, no enforcement yet.
    Detected,
    /// An enforcement action was taken.
    Blocked,
    /// Closed by an administrator.
    Resolved,
}

impl ThreatStatus {
    /// Returns a stable storage value for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Blocked => "blocked",
            Self::Resolved => "resolved",
        }
    }

    /// Returns whether a record in this status may move to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Detected, Self::Blocked)
                | (Self::Detected, Self::Resolved)
                | (Self::Blocked, Self::Resolved)
        )
    }
}

impl FromStr for ThreatStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "detected" => Ok(Self::Detected),
            "blocked" => Ok(Self::Blocked),
            "resolved" => Ok(Self::Resolved),
            _ => Err(AppError::Validation(format!(
                "unknown threat status value '{value}'"
            ))),
        }
    }
}

/// Outcome of an authentication attempt carried by a request event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    /// Credentials were accepted.
    Success,
    /// Credentials were rejected.
    Failure,
}

/// Structured view of one inbound request as seen by the detector.
///
/// Every field is optional: partial events are scored with reduced
/// confidence instead of being rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestEvent {
    /// Storage key of the resolved identity.
    pub identity_key: Option<String>,
    /// Network origin, typically the caller's subnet.
    pub origin: Option<String>,
    /// HTTP method.
    pub method: Option<String>,
    /// Request path without query string.
    pub path: Option<String>,
    /// Raw query string.
    pub query: Option<String>,
    /// Request body or a textual excerpt of it.
    pub payload: Option<String>,
    /// Selected request headers, lowercase names. Only
    /// [`RequestEvent::INSPECTED_HEADERS`] are scanned.
    pub headers: BTreeMap<String, String>,
    /// Caller user agent.
    pub user_agent: Option<String>,
    /// Resolved geography, usually an ISO country code.
    pub geo: Option<String>,
    /// Authentication result for login-style endpoints.
    pub auth_outcome: Option<AuthOutcome>,
}

impl RequestEvent {
    /// Header names whose values are scanned by signature rules.
    pub const INSPECTED_HEADERS: &'static [&'static str] = &[
        "referer",
        "origin",
        "x-forwarded-host",
        "x-original-url",
        "x-rewrite-url",
    ];

    /// Multiplier applied to every finding's confidence, in `[0.5, 1.0]`.
    ///
    /// Each missing core field (identity, origin, method, path) costs 15%.
    #[must_use]
    pub fn completeness(&self) -> f64 {
        let missing = [
            self.identity_key.as_deref(),
            self.origin.as_deref(),
            self.method.as_deref(),
            self.path.as_deref(),
        ]
        .into_iter()
        .filter(|field| field.is_none_or(|value| value.trim().is_empty()))
        .count();

        let exponent = i32::try_from(missing).unwrap_or(i32::MAX);
        0.85_f64.powi(exponent).max(0.5)
    }

    /// Returns the texts scanned by payload signature rules.
    #[must_use]
    pub fn inspectable_texts(&self) -> Vec<&str> {
        let inspected_headers = Self::INSPECTED_HEADERS
            .iter()
            .filter_map(|name| self.headers.get(*name).map(String::as_str));

        [
            self.payload.as_deref(),
            self.query.as_deref(),
            self.path.as_deref(),
            self.user_agent.as_deref(),
        ]
        .into_iter()
        .flatten()
        .chain(inspected_headers)
        .filter(|value| !value.is_empty())
        .collect()
    }
}

/// Decision returned to the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatAction {
    /// Proceed normally.
    Allow,
    /// Proceed, but a threat event awaits review.
    Flag,
    /// Reject the request.
    Block,
}

impl ThreatAction {
    /// Returns a stable label for logs and responses.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Flag => "flag",
            Self::Block => "block",
        }
    }
}

/// Detector output for one request event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAssessment {
    /// Winning attack classification, if any rule fired.
    pub attack_type: Option<AttackType>,
    /// Severity of the winning classification.
    pub severity: Option<ThreatSeverity>,
    /// Confidence of the winning classification after degradation.
    pub confidence: f64,
    /// Enforcement decision.
    pub action: ThreatAction,
    /// Identifier of the persisted threat event, if one was written.
    pub threat_event_id: Option<Uuid>,
}

impl ThreatAssessment {
    /// Assessment for a request with no findings.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            attack_type: None,
            severity: None,
            confidence: 0.0,
            action: ThreatAction::Allow,
            threat_event_id: None,
        }
    }
}

/// Persisted record of a detected anomalous request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    /// Record identifier.
    pub id: Uuid,
    /// Storage key of the offending identity, or `unknown`.
    pub identity_key: String,
    /// Attack classification.
    pub attack_type: AttackType,
    /// Severity at detection time.
    pub severity: ThreatSeverity,
    /// Review status. The only mutable field.
    pub status: ThreatStatus,
    /// Confidence at detection time.
    pub confidence: f64,
    /// Detection timestamp.
    pub detected_at: DateTime<Utc>,
    /// Rule evidence and request context.
    pub evidence: Value,
}

/// Filters for listing threat events. Empty filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatEventQuery {
    /// Restrict to one identity.
    pub identity_key: Option<String>,
    /// Restrict to one attack type.
    pub attack_type: Option<AttackType>,
    /// Minimum severity, inclusive.
    pub min_severity: Option<ThreatSeverity>,
    /// Restrict to one status.
    pub status: Option<ThreatStatus>,
    /// Only events detected at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of rows, newest first.
    pub limit: Option<u32>,
}

impl ThreatEventQuery {
    /// Default page size applied when no limit is given.
    pub const DEFAULT_LIMIT: u32 = 100;

    /// Returns whether `event` satisfies every filter.
    #[must_use]
    pub fn matches(&self, event: &ThreatEvent) -> bool {
        self.identity_key
            .as_deref()
            .is_none_or(|key| key == event.identity_key)
            && self
                .attack_type
                .is_none_or(|attack_type| attack_type == event.attack_type)
            && self
                .min_severity
                .is_none_or(|severity| event.severity >= severity)
            && self.status.is_none_or(|status| status == event.status)
            && self.since.is_none_or(|since| event.detected_at >= since)
    }

    /// Returns the effective row limit.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1_000)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{AttackType, RequestEvent, ThreatSeverity, ThreatStatus};

    #[test]
    fn status_transitions_follow_review_lifecycle() {
        assert!(ThreatStatus::Detected.can_transition_to(ThreatStatus::Blocked));
        assert!(ThreatStatus::Detected.can_transition_to(ThreatStatus::Resolved));
        assert!(ThreatStatus::Blocked.can_transition_to(ThreatStatus::Resolved));
        assert!(!ThreatStatus::Resolved.can_transition_to(ThreatStatus::Detected));
        assert!(!ThreatStatus::Blocked.can_transition_to(ThreatStatus::Detected));
        assert!(!ThreatStatus::Resolved.can_transition_to(ThreatStatus::Blocked));
    }

    #[test]
    fn severity_is_ordered() {
        assert!(ThreatSeverity::Critical > ThreatSeverity::High);
        assert!(ThreatSeverity::High > ThreatSeverity::Medium);
        assert!(ThreatSeverity::Medium > ThreatSeverity::Low);
    }

    #[test]
    fn storage_values_roundtrip() {
        assert_eq!(
            AttackType::from_str(AttackType::CredentialStuffing.as_str()).ok(),
            Some(AttackType::CredentialStuffing)
        );
        assert_eq!(
            ThreatSeverity::from_str("critical").ok(),
            Some(ThreatSeverity::Critical)
        );
        assert!(ThreatStatus::from_str("open").is_err());
    }

    #[test]
    fn missing_fields_degrade_completeness() {
        let full = RequestEvent {
            identity_key: Some("user:1".to_owned()),
            origin: Some("10.0.0.0/24".to_owned()),
            method: Some("POST".to_owned()),
            path: Some("/api/bookings".to_owned()),
            ..RequestEvent::default()
        };
        assert!((full.completeness() - 1.0).abs() < f64::EPSILON);

        let partial = RequestEvent {
            path: Some("/api/bookings".to_owned()),
            ..RequestEvent::default()
        };
        assert!(partial.completeness() < 1.0);
        assert!(RequestEvent::default().completeness() >= 0.5);
    }

    #[test]
    fn user_agent_and_selected_headers_are_inspectable() {
        let mut event = RequestEvent {
            path: Some("/v1/bookings".to_owned()),
            user_agent: Some("fleet-mobile/4.2".to_owned()),
            ..RequestEvent::default()
        };
        event
            .headers
            .insert("referer".to_owned(), "https://fleet.example/cars".to_owned());
        event.headers.insert("accept".to_owned(), "*/*".to_owned());

        assert_eq!(
            event.inspectable_texts(),
            vec!["/v1/bookings", "fleet-mobile/4.2", "https://fleet.example/cars"]
        );
    }

    #[test]
    fn partial_events_deserialize() {
        let Ok(event) = serde_json::from_str::<RequestEvent>(r#"{"path":"/v1/sessions"}"#) else {
            panic!("partial event must deserialize");
        };

        assert_eq!(event.path.as_deref(), Some("/v1/sessions"));
        assert!(event.headers.is_empty());
    }
}
