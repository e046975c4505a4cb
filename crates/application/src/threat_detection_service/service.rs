use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{
    AttackType, RequestEvent, ThreatAction, ThreatAssessment, ThreatEvent, ThreatEventQuery,
    ThreatSeverity, ThreatStatus,
};

use super::config::ThreatDetectionConfig;
use super::ports::ThreatEventRepository;
use super::rules::{DetectionRule, RuleFinding};
use super::severity::classify;
use super::signature_rules::PayloadSignatureRule;
use super::statistics::TrafficStatistics;
use super::traffic_rules::{BehavioralRule, CredentialStuffingRule, VelocityRule};
use crate::rate_limit_service::RateLimitService;
use crate::store_guard::with_store_timeout;

/// Identity recorded on threat events that carry no identity key.
const UNKNOWN_IDENTITY: &str = "unknown";

struct ScoredFinding {
    rule: &'static str,
    finding: RuleFinding,
    confidence: f64,
    severity: ThreatSeverity,
}

impl ScoredFinding {
    fn rank(&self, other: &Self) -> Ordering {
        self.severity
            .cmp(&other.severity)
            .then_with(|| self.confidence.total_cmp(&other.confidence))
    }
}

/// Application service classifying request events into threats.
#[derive(Clone)]
pub struct ThreatDetectionService {
    repository: Arc<dyn ThreatEventRepository>,
    rate_limit_service: Option<RateLimitService>,
    rules: Arc<Vec<Box<dyn DetectionRule>>>,
    statistics: Arc<TrafficStatistics>,
    config: Arc<ThreatDetectionConfig>,
}

impl ThreatDetectionService {
    /// Creates a detector running every enabled built-in rule.
    pub fn new(
        repository: Arc<dyn ThreatEventRepository>,
        config: ThreatDetectionConfig,
    ) -> AppResult<Self> {
        config.validate()?;

        let built_in: Vec<Box<dyn DetectionRule>> = vec![
            Box::new(PayloadSignatureRule::sql_injection(
                config.max_inspected_bytes,
            )?),
            Box::new(PayloadSignatureRule::cross_site_scripting(
                config.max_inspected_bytes,
            )?),
            Box::new(VelocityRule::new(&config)),
            Box::new(CredentialStuffingRule::new(&config)),
            Box::new(BehavioralRule::new(&config)),
        ];

        Self::with_rules(repository, config, built_in)
    }

    /// Creates a detector with an explicit rule set.
    ///
    /// Rules run in the given order; disabled names are dropped.
    pub fn with_rules(
        repository: Arc<dyn ThreatEventRepository>,
        config: ThreatDetectionConfig,
        rules: Vec<Box<dyn DetectionRule>>,
    ) -> AppResult<Self> {
        config.validate()?;

        let rules: Vec<Box<dyn DetectionRule>> = rules
            .into_iter()
            .filter(|rule| config.is_rule_enabled(rule.name()))
            .collect();

        Ok(Self {
            repository,
            rate_limit_service: None,
            rules: Arc::new(rules),
            statistics: Arc::new(TrafficStatistics::new(&config)),
            config: Arc::new(config),
        })
    }

    /// Bans identities behind critical threats through the rate limiter.
    #[must_use]
    pub fn with_rate_limit_feedback(mut self, rate_limit_service: RateLimitService) -> Self {
        self.rate_limit_service = Some(rate_limit_service);
        self
    }

    /// Names of the active rules, in evaluation order.
    #[must_use]
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Number of identities and origins held in the statistics cache.
    pub fn tracked_profiles(&self) -> AppResult<usize> {
        self.statistics.tracked_keys()
    }

    /// Scores one request event and applies the resulting action.
    ///
    /// Never fails: internal errors are logged and resolve to `Allow`.
    pub async fn observe(&self, event: &RequestEvent, now: DateTime<Utc>) -> ThreatAssessment {
        match self.try_observe(event, now).await {
            Ok(assessment) => assessment,
            Err(error) => {
                error!(
                    identity_key = event.identity_key.as_deref().unwrap_or(UNKNOWN_IDENTITY),
                    error = %error,
                    "threat detection failed, allowing request"
                );
                ThreatAssessment::allow()
            }
        }
    }

    /// Lists persisted threat events, newest first.
    pub async fn list_threat_events(
        &self,
        query: ThreatEventQuery,
    ) -> AppResult<Vec<ThreatEvent>> {
        let query = ThreatEventQuery {
            limit: Some(query.effective_limit()),
            ..query
        };

        self.store_call(
            "query_threat_events",
            self.repository.query_threat_events(&query),
        )
        .await
    }

    /// Marks a threat event as resolved after administrative review.
    pub async fn resolve_threat_event(&self, id: Uuid) -> AppResult<ThreatEvent> {
        let event = self
            .store_call("find_threat_event", self.repository.find_threat_event(id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("threat event '{id}' does not exist")))?;

        if !event.status.can_transition_to(ThreatStatus::Resolved) {
            return Err(AppError::Conflict(format!(
                "threat event '{id}' is already {}",
                event.status.as_str()
            )));
        }

        let updated = self
            .store_call(
                "update_threat_status",
                self.repository
                    .update_status(id, event.status, ThreatStatus::Resolved),
            )
            .await?;
        if !updated {
            return Err(AppError::Conflict(format!(
                "threat event '{id}' changed status concurrently"
            )));
        }

        info!(threat_event_id = %id, "threat event resolved");

        Ok(ThreatEvent {
            status: ThreatStatus::Resolved,
            ..event
        })
    }

    async fn try_observe(
        &self,
        event: &RequestEvent,
        now: DateTime<Utc>,
    ) -> AppResult<ThreatAssessment> {
        let traffic = self.statistics.observe(event, now)?;
        let completeness = event.completeness();

        let findings: Vec<ScoredFinding> = self
            .rules
            .iter()
            .filter_map(|rule| {
                rule.evaluate(event, &traffic).map(|finding| {
                    let confidence = (finding.confidence * completeness).clamp(0.0, 1.0);
                    ScoredFinding {
                        rule: rule.name(),
                        severity: classify(finding.attack_type, confidence),
                        confidence,
                        finding,
                    }
                })
            })
            .collect();

        let Some(winner) = findings.iter().max_by(|left, right| left.rank(right)) else {
            return Ok(ThreatAssessment::allow());
        };

        let identity_key = event
            .identity_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(UNKNOWN_IDENTITY);
        let attack_type = winner.finding.attack_type;

        if winner.severity == ThreatSeverity::Low {
            info!(
                identity_key = %identity_key,
                attack_type = attack_type.as_str(),
                rule = winner.rule,
                confidence = winner.confidence,
                "low severity anomaly observed"
            );
            return Ok(assessment(
                attack_type,
                winner.severity,
                winner.confidence,
                ThreatAction::Allow,
                None,
            ));
        }

        let threat_event = ThreatEvent {
            id: Uuid::new_v4(),
            identity_key: identity_key.to_owned(),
            attack_type,
            severity: winner.severity,
            status: ThreatStatus::Detected,
            confidence: winner.confidence,
            detected_at: now,
            evidence: evidence(event, completeness, winner, &findings),
        };
        let threat_event_id = threat_event.id;

        self.store_call(
            "put_threat_event",
            self.repository.put_threat_event(threat_event),
        )
        .await?;

        if winner.severity < ThreatSeverity::Critical {
            warn!(
                threat_event_id = %threat_event_id,
                identity_key = %identity_key,
                attack_type = attack_type.as_str(),
                severity = winner.severity.as_str(),
                confidence = winner.confidence,
                "threat flagged for review"
            );
            return Ok(assessment(
                attack_type,
                winner.severity,
                winner.confidence,
                ThreatAction::Flag,
                Some(threat_event_id),
            ));
        }

        self.enforce(threat_event_id, identity_key, attack_type, now)
            .await;

        warn!(
            threat_event_id = %threat_event_id,
            identity_key = %identity_key,
            attack_type = attack_type.as_str(),
            confidence = winner.confidence,
            "critical threat blocked"
        );

        Ok(assessment(
            attack_type,
            winner.severity,
            winner.confidence,
            ThreatAction::Block,
            Some(threat_event_id),
        ))
    }

    /// Bans the identity and moves the event to `Blocked`.
    ///
    /// Credential stuffing events name the targeted account, not the
    /// attacker, so they are blocked without a ban. Failures here are
    /// logged; the current request is blocked regardless.
    async fn enforce(
        &self,
        threat_event_id: Uuid,
        identity_key: &str,
        attack_type: AttackType,
        now: DateTime<Utc>,
    ) {
        if let Some(rate_limit_service) = self
            .rate_limit_service
            .as_ref()
            .filter(|_| {
                identity_key != UNKNOWN_IDENTITY && attack_type != AttackType::CredentialStuffing
            })
        {
            let reason = format!("critical {} threat {threat_event_id}", attack_type.as_str());
            if let Err(error) = rate_limit_service
                .impose_ban(identity_key, reason.as_str(), now)
                .await
            {
                error!(
                    threat_event_id = %threat_event_id,
                    identity_key = %identity_key,
                    error = %error,
                    "failed to ban identity for critical threat"
                );
                return;
            }
        }

        match self
            .store_call(
                "update_threat_status",
                self.repository.update_status(
                    threat_event_id,
                    ThreatStatus::Detected,
                    ThreatStatus::Blocked,
                ),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                threat_event_id = %threat_event_id,
                "threat event left detected state before it could be blocked"
            ),
            Err(error) => error!(
                threat_event_id = %threat_event_id,
                error = %error,
                "failed to mark threat event blocked"
            ),
        }
    }

    async fn store_call<T, F>(&self, operation: &'static str, future: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        with_store_timeout(self.config.store_timeout, operation, future).await
    }
}

fn assessment(
    attack_type: AttackType,
    severity: ThreatSeverity,
    confidence: f64,
    action: ThreatAction,
    threat_event_id: Option<Uuid>,
) -> ThreatAssessment {
    ThreatAssessment {
        attack_type: Some(attack_type),
        severity: Some(severity),
        confidence,
        action,
        threat_event_id,
    }
}

fn evidence(
    event: &RequestEvent,
    completeness: f64,
    winner: &ScoredFinding,
    findings: &[ScoredFinding],
) -> serde_json::Value {
    json!({
        "rule": winner.rule,
        "details": winner.finding.evidence,
        "completeness": completeness,
        "findings": findings
            .iter()
            .map(|scored| json!({
                "rule": scored.rule,
                "attack_type": scored.finding.attack_type.as_str(),
                "severity": scored.severity.as_str(),
                "confidence": scored.confidence,
            }))
            .collect::<Vec<_>>(),
        "request": {
            "method": event.method,
            "path": event.path,
            "origin": event.origin,
            "user_agent": event.user_agent,
            "geo": event.geo,
        },
    })
}
