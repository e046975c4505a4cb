use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use tokio::task::JoinSet;

use fleetguard_domain::{FailurePolicy, Identity, RateLimitDecision, Tier, TierThresholds};

use crate::test_support::FakeSecurityStore;

use super::{RateLimitConfig, RateLimitService};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn thresholds(
    requests_per_window: u32,
    window_seconds: u32,
    burst_ceiling: u32,
    burst_window_seconds: u32,
) -> TierThresholds {
    let Ok(thresholds) = TierThresholds::new(
        requests_per_window,
        window_seconds,
        burst_ceiling,
        burst_window_seconds,
    ) else {
        panic!("test thresholds must be valid");
    };
    thresholds
}

fn config_for(tier: Tier, tier_thresholds: TierThresholds) -> RateLimitConfig {
    let mut config = RateLimitConfig::default();
    config.tiers.insert(tier, tier_thresholds);
    config
}

fn service_with(config: RateLimitConfig) -> (Arc<FakeSecurityStore>, RateLimitService) {
    let store = Arc::new(FakeSecurityStore::default());
    let service = RateLimitService::new(store.clone(), config);
    (store, service)
}

fn user(id: &str) -> Identity {
    let Ok(identity) = Identity::user(id) else {
        panic!("test identity must be valid");
    };
    identity
}

#[tokio::test]
async fn standard_tier_burst_of_eleven_in_two_seconds_is_throttled() {
    let (_, service) = service_with(RateLimitConfig::default());
    let identity = user("renter-0");

    for step in 0..10 {
        let now = t0() + Duration::milliseconds(200 * step);
        assert_eq!(
            service.check(&identity, Tier::Standard, now).await,
            RateLimitDecision::Allow,
            "request {step} should pass"
        );
    }

    let decision = service
        .check(&identity, Tier::Standard, t0() + Duration::seconds(2))
        .await;
    match decision {
        RateLimitDecision::Throttle {
            retry_after_seconds,
        } => assert_eq!(retry_after_seconds, 3),
        other => panic!("expected throttle, got {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_main_window_retries_after_the_window_remainder() {
    let (_, service) = service_with(config_for(Tier::Standard, thresholds(10, 60, 100, 5)));
    let identity = user("renter-1");

    for step in 0..10 {
        let now = t0() + Duration::milliseconds(200 * step);
        assert_eq!(
            service.check(&identity, Tier::Standard, now).await,
            RateLimitDecision::Allow,
            "request {step} should pass"
        );
    }

    let decision = service
        .check(&identity, Tier::Standard, t0() + Duration::seconds(2))
        .await;
    match decision {
        RateLimitDecision::Throttle {
            retry_after_seconds,
        } => assert_eq!(retry_after_seconds, 58),
        other => panic!("expected throttle, got {other:?}"),
    }
}

#[tokio::test]
async fn window_rollover_restores_the_budget() {
    let (_, service) = service_with(config_for(Tier::Basic, thresholds(2, 60, 100, 5)));
    let identity = user("renter-2");

    for _ in 0..2 {
        assert!(service.check(&identity, Tier::Basic, t0()).await.is_allowed());
    }
    assert!(!service.check(&identity, Tier::Basic, t0()).await.is_allowed());

    let rolled = t0() + Duration::seconds(60);
    assert_eq!(
        service.check(&identity, Tier::Basic, rolled).await,
        RateLimitDecision::Allow
    );
}

#[tokio::test]
async fn burst_ceiling_throttles_inside_the_main_budget() {
    let (_, service) = service_with(config_for(Tier::Premium, thresholds(100, 60, 3, 5)));
    let identity = user("renter-3");

    for _ in 0..3 {
        assert!(
            service
                .check(&identity, Tier::Premium, t0())
                .await
                .is_allowed()
        );
    }

    match service.check(&identity, Tier::Premium, t0()).await {
        RateLimitDecision::Throttle {
            retry_after_seconds,
        } => assert!(retry_after_seconds <= 5),
        other => panic!("expected burst throttle, got {other:?}"),
    }

    let after_burst = t0() + Duration::seconds(5);
    assert!(
        service
            .check(&identity, Tier::Premium, after_burst)
            .await
            .is_allowed()
    );
}

#[tokio::test]
async fn burst_breach_bans_immediately_when_configured() {
    let mut config = config_for(Tier::Basic, thresholds(100, 60, 1, 5));
    config.ban_on_burst = true;
    let (store, service) = service_with(config);
    let identity = user("renter-4");

    assert!(service.check(&identity, Tier::Basic, t0()).await.is_allowed());
    assert!(matches!(
        service.check(&identity, Tier::Basic, t0()).await,
        RateLimitDecision::Banned { .. }
    ));
    assert!(store.ban(identity.key().as_str()).await.is_some());
}

#[tokio::test]
async fn repeated_violations_escalate_ban_durations_up_to_the_cap() {
    let mut config = config_for(Tier::Standard, thresholds(1, 60, 100, 1));
    config.violations_before_ban = 1;
    config.base_ban_seconds = 60;
    config.ban_multiplier = 2;
    config.max_ban_seconds = 300;
    let (_, service) = service_with(config);
    let identity = user("renter-5");

    let mut now = t0();
    for expected_seconds in [60, 120, 240, 300] {
        assert_eq!(
            service.check(&identity, Tier::Standard, now).await,
            RateLimitDecision::Allow
        );

        let RateLimitDecision::Banned { until } =
            service.check(&identity, Tier::Standard, now).await
        else {
            panic!("second request in the window must be banned");
        };
        assert_eq!((until - now).num_seconds(), expected_seconds);

        now = until + Duration::seconds(1);
    }
}

#[tokio::test]
async fn banned_identity_is_rejected_without_counting() {
    let mut config = config_for(Tier::Standard, thresholds(1, 60, 100, 1));
    config.violations_before_ban = 1;
    let (_, service) = service_with(config);
    let identity = user("renter-6");
    let key = identity.key();

    assert!(service.check(&identity, Tier::Standard, t0()).await.is_allowed());
    assert!(matches!(
        service.check(&identity, Tier::Standard, t0()).await,
        RateLimitDecision::Banned { .. }
    ));
    let Ok(Some(before)) = service.current_window(key.as_str()).await else {
        panic!("window must exist");
    };

    let later = t0() + Duration::seconds(10);
    assert!(matches!(
        service.check(&identity, Tier::Standard, later).await,
        RateLimitDecision::Banned { .. }
    ));
    let Ok(Some(after)) = service.current_window(key.as_str()).await else {
        panic!("window must exist");
    };
    assert_eq!(before, after);
}

#[tokio::test]
async fn imposed_ban_never_shortens_an_active_one() {
    let (_, service) = service_with(RateLimitConfig::default());

    let Ok(first) = service.impose_ban("user:renter-7", "manual", t0()).await else {
        panic!("first ban must be stored");
    };
    let Ok(second) = service
        .impose_ban("user:renter-7", "manual", t0() + Duration::seconds(10))
        .await
    else {
        panic!("second ban must be stored");
    };

    assert_eq!(first.offense_count, 1);
    assert_eq!(second.offense_count, 2);
    assert!(second.expires_at >= first.expires_at);

    let Ok(active) = service
        .active_ban("user:renter-7", t0() + Duration::seconds(20))
        .await
    else {
        panic!("ban lookup must succeed");
    };
    assert_eq!(active.map(|ban| ban.expires_at), Some(second.expires_at));
}

#[tokio::test]
async fn identities_have_independent_budgets() {
    let (_, service) = service_with(config_for(Tier::Basic, thresholds(1, 60, 100, 5)));
    let first = user("renter-8");
    let second = user("renter-9");

    assert!(service.check(&first, Tier::Basic, t0()).await.is_allowed());
    assert!(!service.check(&first, Tier::Basic, t0()).await.is_allowed());
    assert!(service.check(&second, Tier::Basic, t0()).await.is_allowed());
}

#[tokio::test]
async fn store_outage_fails_open_for_customer_tiers() {
    let (store, service) = service_with(RateLimitConfig::default());
    store.set_failing(true);

    assert_eq!(
        service.check(&user("renter-10"), Tier::Basic, t0()).await,
        RateLimitDecision::Allow
    );
}

#[tokio::test]
async fn store_outage_fails_closed_for_admin_and_closed_endpoints() {
    let mut config = RateLimitConfig::default();
    config
        .endpoint_failure_policies
        .insert("payments".to_owned(), FailurePolicy::Closed);
    let (store, service) = service_with(config);
    store.set_failing(true);
    let identity = user("renter-11");

    assert_eq!(
        service.check(&identity, Tier::Admin, t0()).await,
        RateLimitDecision::Throttle {
            retry_after_seconds: 30
        }
    );
    assert_eq!(
        service
            .check_endpoint("payments", &identity, Tier::Basic, t0())
            .await,
        RateLimitDecision::Throttle {
            retry_after_seconds: 30
        }
    );
    assert_eq!(
        service
            .check_endpoint("search", &identity, Tier::Basic, t0())
            .await,
        RateLimitDecision::Allow
    );
}

#[tokio::test]
async fn slow_store_is_treated_as_unavailable() {
    let config = RateLimitConfig {
        store_timeout: StdDuration::from_millis(10),
        ..RateLimitConfig::default()
    };
    let store = Arc::new(FakeSecurityStore::slow(StdDuration::from_millis(200)));
    let service = RateLimitService::new(store, config);

    assert_eq!(
        service
            .check_with_policy(&user("renter-12"), Tier::Basic, t0(), FailurePolicy::Closed)
            .await,
        RateLimitDecision::Throttle {
            retry_after_seconds: 30
        }
    );
}

#[tokio::test]
async fn concurrent_checks_never_admit_more_than_the_ceiling() {
    let (_, service) = service_with(config_for(Tier::Standard, thresholds(20, 60, 100, 5)));
    let identity = user("renter-13");

    let mut checks = JoinSet::new();
    for _ in 0..50 {
        let service = service.clone();
        let identity = identity.clone();
        checks.spawn(async move { service.check(&identity, Tier::Standard, t0()).await });
    }

    let mut allowed = 0;
    while let Some(result) = checks.join_next().await {
        if result.is_ok_and(|decision| decision.is_allowed()) {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 20);
}

#[tokio::test]
async fn cleanup_removes_stale_counters() {
    let (_, service) = service_with(RateLimitConfig::default());
    let identity = user("renter-14");
    assert!(service.check(&identity, Tier::Basic, t0()).await.is_allowed());

    let Ok(removed) = service.cleanup(t0() + Duration::days(3)).await else {
        panic!("cleanup must succeed");
    };

    assert_eq!(removed, 1);
    assert!(matches!(
        service.current_window(identity.key().as_str()).await,
        Ok(None)
    ));
}

#[test]
fn ban_duration_grows_geometrically_and_caps() {
    let config = RateLimitConfig {
        base_ban_seconds: 60,
        ban_multiplier: 3,
        max_ban_seconds: 1_000,
        ..RateLimitConfig::default()
    };

    assert_eq!(config.ban_duration(1).num_seconds(), 60);
    assert_eq!(config.ban_duration(2).num_seconds(), 180);
    assert_eq!(config.ban_duration(3).num_seconds(), 540);
    assert_eq!(config.ban_duration(4).num_seconds(), 1_000);
    assert_eq!(config.ban_duration(u32::MAX).num_seconds(), 1_000);
}

proptest! {
    #[test]
    fn first_k_requests_pass_and_the_next_is_rejected(limit in 1_u32..40) {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_time().build()
        else {
            panic!("test runtime must build");
        };

        runtime.block_on(async {
            let (_, service) =
                service_with(config_for(Tier::Standard, thresholds(limit, 60, limit, 60)));
            let identity = user("renter-prop");

            for step in 0..limit {
                let now = t0() + Duration::milliseconds(i64::from(step));
                prop_assert!(service.check(&identity, Tier::Standard, now).await.is_allowed());
            }

            let now = t0() + Duration::milliseconds(i64::from(limit));
            prop_assert!(!service.check(&identity, Tier::Standard, now).await.is_allowed());
            Ok(())
        })?;
    }
}
