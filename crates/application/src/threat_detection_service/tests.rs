use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use fleetguard_core::AppError;
use fleetguard_domain::{
    AttackType, AuthOutcome, RequestEvent, ThreatAction, ThreatEventQuery, ThreatSeverity,
    ThreatStatus,
};

use crate::rate_limit_service::{RateLimitConfig, RateLimitService};
use crate::test_support::FakeSecurityStore;

use super::{ThreatDetectionConfig, ThreatDetectionService};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn detector_with(config: ThreatDetectionConfig) -> (Arc<FakeSecurityStore>, ThreatDetectionService) {
    let store = Arc::new(FakeSecurityStore::default());
    let Ok(detector) = ThreatDetectionService::new(store.clone(), config) else {
        panic!("detector must build");
    };
    (store, detector)
}

fn detector() -> (Arc<FakeSecurityStore>, ThreatDetectionService) {
    detector_with(ThreatDetectionConfig::default())
}

fn event(identity_key: &str, payload: &str) -> RequestEvent {
    RequestEvent {
        identity_key: Some(identity_key.to_owned()),
        origin: Some("203.0.113.0/24".to_owned()),
        method: Some("POST".to_owned()),
        path: Some("/v1/bookings".to_owned()),
        payload: Some(payload.to_owned()),
        user_agent: Some("fleet-mobile/4.2".to_owned()),
        geo: Some("DE".to_owned()),
        ..RequestEvent::default()
    }
}

#[tokio::test]
async fn sql_injection_is_flagged_and_persisted() {
    let (store, detector) = detector();

    let assessment = detector
        .observe(&event("user:mallory", r#"{"email":"' OR 1=1 --"}"#), t0())
        .await;

    assert_eq!(assessment.attack_type, Some(AttackType::Sqli));
    assert!(assessment.severity >= Some(ThreatSeverity::Medium));
    assert_eq!(assessment.action, ThreatAction::Flag);

    let events = store.threat_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(Some(events[0].id), assessment.threat_event_id);
    assert_eq!(events[0].status, ThreatStatus::Detected);
    assert_eq!(events[0].identity_key, "user:mallory");
}

#[tokio::test]
async fn injection_carried_in_headers_is_detected() {
    let (store, detector) = detector();
    let mut request = event("net:198.51.100.7:9f2c", "{}");
    request.user_agent = Some("' OR 1=1 --".to_owned());
    request
        .headers
        .insert("referer".to_owned(), "<script>alert(1)</script>".to_owned());

    let assessment = detector.observe(&request, t0()).await;

    assert_ne!(assessment.action, ThreatAction::Allow);
    assert!(matches!(
        assessment.attack_type,
        Some(AttackType::Xss | AttackType::Sqli)
    ));
    assert_eq!(store.threat_events().await.len(), 1);
}

#[tokio::test]
async fn benign_request_is_allowed_without_a_record() {
    let (store, detector) = detector();

    let assessment = detector
        .observe(&event("user:alice", r#"{"name":"Alice"}"#), t0())
        .await;

    assert_eq!(assessment.action, ThreatAction::Allow);
    assert_eq!(assessment.attack_type, None);
    assert!(store.threat_events().await.is_empty());
}

#[tokio::test]
async fn critical_script_injection_blocks_and_bans() {
    let store = Arc::new(FakeSecurityStore::default());
    let rate_limit_service = RateLimitService::new(store.clone(), RateLimitConfig::default());
    let Ok(detector) =
        ThreatDetectionService::new(store.clone(), ThreatDetectionConfig::default())
    else {
        panic!("detector must build");
    };
    let detector = detector.with_rate_limit_feedback(rate_limit_service);

    let assessment = detector
        .observe(
            &event(
                "user:mallory",
                r#"<script>alert(1)</script><img src=x onerror=alert(1)>"#,
            ),
            t0(),
        )
        .await;

    assert_eq!(assessment.attack_type, Some(AttackType::Xss));
    assert_eq!(assessment.severity, Some(ThreatSeverity::Critical));
    assert_eq!(assessment.action, ThreatAction::Block);

    let events = store.threat_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, ThreatStatus::Blocked);

    let Some(ban) = store.ban("user:mallory").await else {
        panic!("critical threat must ban the identity");
    };
    assert!(ban.is_active(t0() + Duration::seconds(1)));
}

#[tokio::test]
async fn low_confidence_findings_are_only_logged() {
    let (store, detector) = detector();

    let assessment = detector
        .observe(&event("user:bob", "pickup at 9 -- see notes"), t0())
        .await;

    assert_eq!(assessment.action, ThreatAction::Allow);
    assert_eq!(assessment.severity, Some(ThreatSeverity::Low));
    assert!(assessment.threat_event_id.is_none());
    assert!(store.threat_events().await.is_empty());
}

#[tokio::test]
async fn partial_events_are_scored_with_reduced_confidence() {
    let (_, full_detector) = detector();
    let (_, partial_detector) = detector();
    let payload = r#"{"email":"' OR 1=1 --"}"#;

    let full = full_detector
        .observe(&event("user:mallory", payload), t0())
        .await;
    let partial = partial_detector
        .observe(
            &RequestEvent {
                payload: Some(payload.to_owned()),
                ..RequestEvent::default()
            },
            t0(),
        )
        .await;

    assert_eq!(partial.attack_type, Some(AttackType::Sqli));
    assert!(partial.confidence < full.confidence);
    assert!(partial.confidence >= full.confidence * 0.5);
}

#[tokio::test]
async fn store_failure_resolves_to_allow() {
    let (store, detector) = detector();
    store.set_failing(true);

    let assessment = detector
        .observe(&event("user:mallory", r#"{"email":"' OR 1=1 --"}"#), t0())
        .await;

    assert_eq!(assessment.action, ThreatAction::Allow);
    assert!(assessment.threat_event_id.is_none());
}

#[tokio::test]
async fn disabled_rules_do_not_run() {
    let (store, detector) = detector_with(ThreatDetectionConfig {
        disabled_rules: BTreeSet::from(["sqli".to_owned()]),
        ..ThreatDetectionConfig::default()
    });

    let assessment = detector
        .observe(&event("user:mallory", r#"{"email":"' OR 1=1 --"}"#), t0())
        .await;

    assert_eq!(assessment.action, ThreatAction::Allow);
    assert!(!detector.rule_names().contains(&"sqli"));
    assert!(store.threat_events().await.is_empty());
}

#[tokio::test]
async fn unknown_rule_names_are_rejected() {
    let store = Arc::new(FakeSecurityStore::default());
    let result = ThreatDetectionService::new(
        store,
        ThreatDetectionConfig {
            disabled_rules: BTreeSet::from(["port_scan".to_owned()]),
            ..ThreatDetectionConfig::default()
        },
    );

    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn request_flood_is_flagged_as_ddos() {
    let (_, detector) = detector();
    let identity = "api_key:9f2c1e";

    let mut last = None;
    for step in 0..70 {
        let now = t0() + Duration::milliseconds(step * 10);
        last = Some(detector.observe(&event(identity, "{}"), now).await);
    }

    let Some(assessment) = last else {
        panic!("at least one assessment expected");
    };
    assert_eq!(assessment.attack_type, Some(AttackType::Ddos));
    assert_eq!(assessment.action, ThreatAction::Flag);
}

#[tokio::test]
async fn failures_across_many_accounts_are_credential_stuffing() {
    let (store, detector) = detector();

    let mut last = None;
    for account in 0..12 {
        let failed_login = RequestEvent {
            auth_outcome: Some(AuthOutcome::Failure),
            path: Some("/v1/sessions".to_owned()),
            ..event(format!("user:driver-{account}").as_str(), "{}")
        };
        last = Some(
            detector
                .observe(&failed_login, t0() + Duration::seconds(account))
                .await,
        );
    }

    let Some(assessment) = last else {
        panic!("at least one assessment expected");
    };
    assert_eq!(assessment.attack_type, Some(AttackType::CredentialStuffing));
    assert_eq!(assessment.action, ThreatAction::Block);
    assert!(store.ban("user:driver-11").await.is_none());
}

#[tokio::test]
async fn resolving_follows_the_review_lifecycle() {
    let (_, detector) = detector();
    let assessment = detector
        .observe(&event("user:mallory", r#"{"email":"' OR 1=1 --"}"#), t0())
        .await;
    let Some(id) = assessment.threat_event_id else {
        panic!("flagged threat must be persisted");
    };

    let Ok(resolved) = detector.resolve_threat_event(id).await else {
        panic!("detected threat must resolve");
    };
    assert_eq!(resolved.status, ThreatStatus::Resolved);

    assert!(matches!(
        detector.resolve_threat_event(id).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        detector.resolve_threat_event(Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn listing_filters_by_severity_and_status() {
    let (_, detector) = detector();
    detector
        .observe(&event("user:bob", "pickup at 9 -- see notes"), t0())
        .await;
    detector
        .observe(
            &event("user:mallory", r#"{"email":"' OR 1=1 --"}"#),
            t0() + Duration::seconds(1),
        )
        .await;
    detector
        .observe(
            &event("user:eve", r#"{"q":"1 UNION SELECT password FROM users"}"#),
            t0() + Duration::seconds(2),
        )
        .await;

    let Ok(all) = detector
        .list_threat_events(ThreatEventQuery::default())
        .await
    else {
        panic!("listing must succeed");
    };
    assert_eq!(all.len(), 2);
    assert!(all[0].detected_at > all[1].detected_at);

    let Ok(for_eve) = detector
        .list_threat_events(ThreatEventQuery {
            identity_key: Some("user:eve".to_owned()),
            status: Some(ThreatStatus::Detected),
            ..ThreatEventQuery::default()
        })
        .await
    else {
        panic!("listing must succeed");
    };
    assert_eq!(for_eve.len(), 1);
    assert_eq!(for_eve[0].attack_type, AttackType::Sqli);
}

#[tokio::test]
async fn statistics_cache_stays_bounded() {
    let (_, detector) = detector_with(ThreatDetectionConfig {
        max_tracked_keys: 8,
        ..ThreatDetectionConfig::default()
    });

    for index in 0..40 {
        let mut request = event(format!("user:renter-{index}").as_str(), "{}");
        request.origin = None;
        detector
            .observe(&request, t0() + Duration::seconds(index))
            .await;
    }

    let Ok(tracked) = detector.tracked_profiles() else {
        panic!("statistics must be readable");
    };
    assert!(tracked <= 8);
}

#[test]
fn built_in_rules_run_in_a_fixed_order() {
    let Ok(detector) = ThreatDetectionService::new(
        Arc::new(FakeSecurityStore::default()),
        ThreatDetectionConfig::default(),
    ) else {
        panic!("detector must build");
    };

    assert_eq!(
        detector.rule_names(),
        vec!["sqli", "xss", "ddos", "credential_stuffing", "behavioral"]
    );
}
