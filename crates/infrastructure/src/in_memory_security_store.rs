//! Single-process store implementing every security port.
//!
//! Suitable for one API replica and for local development. Each operation
//! runs inside one write-lock critical section, which makes the
//! read-modify-write ports atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use fleetguard_application::{NonceRepository, RateLimitRepository, ThreatEventRepository};
use fleetguard_core::AppResult;
use fleetguard_domain::{
    BanRecord, RateLimitWindow, ThreatEvent, ThreatEventQuery, ThreatStatus, TierThresholds,
};

#[derive(Debug, Clone, Copy)]
struct ViolationTally {
    period_started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Default)]
struct SecurityState {
    windows: HashMap<String, RateLimitWindow>,
    violations: HashMap<String, ViolationTally>,
    bans: HashMap<String, BanRecord>,
    nonces: HashMap<String, DateTime<Utc>>,
    threat_events: HashMap<Uuid, ThreatEvent>,
}

/// In-memory adapter for the rate limit, nonce, and threat event ports.
#[derive(Default)]
pub struct InMemorySecurityStore {
    state: RwLock<SecurityState>,
}

impl InMemorySecurityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitRepository for InMemorySecurityStore {
    async fn get_window(&self, identity_key: &str) -> AppResult<Option<RateLimitWindow>> {
        Ok(self.state.read().await.windows.get(identity_key).copied())
    }

    async fn increment_window(
        &self,
        identity_key: &str,
        thresholds: &TierThresholds,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitWindow> {
        let mut state = self.state.write().await;
        let window = state
            .windows
            .get(identity_key)
            .map(|window| window.advanced(thresholds, now))
            .unwrap_or_else(|| RateLimitWindow::opened_at(now));
        state.windows.insert(identity_key.to_owned(), window);

        Ok(window)
    }

    async fn record_violation(
        &self,
        identity_key: &str,
        weight: u32,
        period_seconds: u32,
        now: DateTime<Utc>,
    ) -> AppResult<u32> {
        let period = Duration::seconds(i64::from(period_seconds));
        let mut state = self.state.write().await;
        let tally = state
            .violations
            .entry(identity_key.to_owned())
            .or_insert(ViolationTally {
                period_started_at: now,
                count: 0,
            });

        if now - tally.period_started_at >= period {
            tally.period_started_at = now;
            tally.count = 0;
        }
        tally.count = tally.count.saturating_add(weight);

        Ok(tally.count)
    }

    async fn reset_violations(&self, identity_key: &str) -> AppResult<()> {
        self.state.write().await.violations.remove(identity_key);
        Ok(())
    }

    async fn get_ban(&self, identity_key: &str) -> AppResult<Option<BanRecord>> {
        Ok(self.state.read().await.bans.get(identity_key).cloned())
    }

    async fn put_ban(&self, record: BanRecord) -> AppResult<()> {
        let mut state = self.state.write().await;
        let merged = match state.bans.get(&record.identity_key) {
            Some(existing) => BanRecord {
                expires_at: existing.expires_at.max(record.expires_at),
                offense_count: existing.offense_count.max(record.offense_count),
                ..record
            },
            None => record,
        };
        state.bans.insert(merged.identity_key.clone(), merged);

        Ok(())
    }

    async fn cleanup_expired(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let initial = state.windows.len() + state.violations.len() + state.bans.len();

        state
            .windows
            .retain(|_, window| window.window_started_at >= before);
        state
            .violations
            .retain(|_, tally| tally.period_started_at >= before);
        state.bans.retain(|_, ban| ban.expires_at >= before);

        let remaining = state.windows.len() + state.violations.len() + state.bans.len();
        Ok(u64::try_from(initial.saturating_sub(remaining)).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl NonceRepository for InMemorySecurityStore {
    async fn is_nonce_consumed(&self, nonce: &str, now: DateTime<Utc>) -> AppResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .nonces
            .get(nonce)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn consume_nonce(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.write().await;
        if state
            .nonces
            .get(nonce)
            .is_some_and(|existing| *existing > now)
        {
            return Ok(false);
        }

        state.nonces.insert(nonce.to_owned(), expires_at);
        Ok(true)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let initial = state.nonces.len();
        state.nonces.retain(|_, expires_at| *expires_at > now);

        Ok(u64::try_from(initial.saturating_sub(state.nonces.len())).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl ThreatEventRepository for InMemorySecurityStore {
    async fn put_threat_event(&self, event: ThreatEvent) -> AppResult<()> {
        self.state
            .write()
            .await
            .threat_events
            .insert(event.id, event);
        Ok(())
    }

    async fn find_threat_event(&self, id: Uuid) -> AppResult<Option<ThreatEvent>> {
        Ok(self.state.read().await.threat_events.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: ThreatStatus,
        next: ThreatStatus,
    ) -> AppResult<bool> {
        let mut state = self.state.write().await;
        match state
            .threat_events
            .get_mut(&id)
            .filter(|event| event.status == expected)
        {
            Some(event) => {
                event.status = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query_threat_events(&self, query: &ThreatEventQuery) -> AppResult<Vec<ThreatEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<ThreatEvent> = state
            .threat_events
            .values()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();

        events.sort_by(|left, right| {
            right
                .detected_at
                .cmp(&left.detected_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        events.truncate(usize::try_from(query.effective_limit()).unwrap_or(usize::MAX));

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use fleetguard_application::{NonceRepository, RateLimitRepository, ThreatEventRepository};
    use fleetguard_domain::{
        AttackType, BanRecord, ThreatEvent, ThreatEventQuery, ThreatSeverity, ThreatStatus,
        TierThresholds,
    };

    use super::InMemorySecurityStore;

    #[tokio::test]
    async fn concurrent_increments_are_serialized() {
        let store = Arc::new(InMemorySecurityStore::new());
        let Ok(thresholds) = TierThresholds::new(100, 60, 10, 5) else {
            panic!("thresholds must be valid");
        };
        let now = Utc::now();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..25 {
            let store = store.clone();
            tasks.spawn(async move { store.increment_window("user:a", &thresholds, now).await });
        }
        while tasks.join_next().await.is_some() {}

        let window = store.get_window("user:a").await;
        assert!(matches!(window, Ok(Some(window)) if window.count == 25));
    }

    #[tokio::test]
    async fn expired_nonces_can_be_consumed_again() {
        let store = InMemorySecurityStore::new();
        let now = Utc::now();
        let expires_at = now + Duration::seconds(30);

        assert!(matches!(store.consume_nonce("ab12", expires_at, now).await, Ok(true)));
        assert!(matches!(store.consume_nonce("ab12", expires_at, now).await, Ok(false)));

        let later = expires_at + Duration::seconds(1);
        assert!(matches!(
            store
                .consume_nonce("ab12", later + Duration::seconds(30), later)
                .await,
            Ok(true)
        ));
    }

    #[tokio::test]
    async fn ban_merge_never_shortens_expiry() {
        let store = InMemorySecurityStore::new();
        let now = Utc::now();
        let long_ban = BanRecord {
            identity_key: "user:a".to_owned(),
            reason: "first".to_owned(),
            banned_at: now,
            expires_at: now + Duration::hours(1),
            offense_count: 3,
        };
        let short_ban = BanRecord {
            reason: "second".to_owned(),
            expires_at: now + Duration::minutes(5),
            offense_count: 1,
            ..long_ban.clone()
        };

        assert!(store.put_ban(long_ban.clone()).await.is_ok());
        assert!(store.put_ban(short_ban).await.is_ok());

        let stored = store.get_ban("user:a").await;
        assert!(matches!(
            stored,
            Ok(Some(ban)) if ban.expires_at == long_ban.expires_at && ban.offense_count == 3
        ));
    }

    #[tokio::test]
    async fn status_updates_require_the_expected_status() {
        let store = InMemorySecurityStore::new();
        let event = ThreatEvent {
            id: Uuid::new_v4(),
            identity_key: "user:a".to_owned(),
            attack_type: AttackType::Xss,
            severity: ThreatSeverity::Critical,
            status: ThreatStatus::Detected,
            confidence: 0.97,
            detected_at: Utc::now(),
            evidence: json!({}),
        };
        assert!(store.put_threat_event(event.clone()).await.is_ok());

        assert!(matches!(
            store
                .update_status(event.id, ThreatStatus::Blocked, ThreatStatus::Resolved)
                .await,
            Ok(false)
        ));
        assert!(matches!(
            store
                .update_status(event.id, ThreatStatus::Detected, ThreatStatus::Blocked)
                .await,
            Ok(true)
        ));

        let blocked = store
            .query_threat_events(&ThreatEventQuery {
                status: Some(ThreatStatus::Blocked),
                ..ThreatEventQuery::default()
            })
            .await;
        assert!(matches!(blocked, Ok(events) if events.len() == 1));
    }
}
