//! In-process store shared by service tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{
    BanRecord, RateLimitWindow, ThreatEvent, ThreatEventQuery, ThreatStatus, TierThresholds,
};

use crate::{NonceRepository, RateLimitRepository, ThreatEventRepository};

#[derive(Default)]
struct FakeState {
    windows: HashMap<String, RateLimitWindow>,
    violations: HashMap<String, (DateTime<Utc>, u32)>,
    bans: HashMap<String, BanRecord>,
    nonces: HashMap<String, DateTime<Utc>>,
    threat_events: Vec<ThreatEvent>,
}

/// Fake implementing every store port, with switchable outages.
#[derive(Default)]
pub(crate) struct FakeSecurityStore {
    state: Mutex<FakeState>,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl FakeSecurityStore {
    /// Store whose every call sleeps for `delay` first.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Makes every subsequent call fail with `StoreUnavailable`.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) async fn threat_events(&self) -> Vec<ThreatEvent> {
        self.state.lock().await.threat_events.clone()
    }

    pub(crate) async fn ban(&self, identity_key: &str) -> Option<BanRecord> {
        self.state.lock().await.bans.get(identity_key).cloned()
    }

    async fn guard(&self) -> AppResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable(
                "fake store is offline".to_owned(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl RateLimitRepository for FakeSecurityStore {
    async fn get_window(&self, identity_key: &str) -> AppResult<Option<RateLimitWindow>> {
        self.guard().await?;
        Ok(self.state.lock().await.windows.get(identity_key).copied())
    }

    async fn increment_window(
        &self,
        identity_key: &str,
        thresholds: &TierThresholds,
        now: DateTime<Utc>,
    ) -> AppResult<RateLimitWindow> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        let window = match state.windows.get(identity_key) {
            Some(window) => window.advanced(thresholds, now),
            None => RateLimitWindow::opened_at(now),
        };
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
        self.guard().await?;
        let mut state = self.state.lock().await;
        let period = chrono::Duration::seconds(i64::from(period_seconds));
        let tally = state
            .violations
            .entry(identity_key.to_owned())
            .or_insert((now, 0));
        if now - tally.0 >= period {
            *tally = (now, 0);
        }
        tally.1 = tally.1.saturating_add(weight);
        Ok(tally.1)
    }

    async fn reset_violations(&self, identity_key: &str) -> AppResult<()> {
        self.guard().await?;
        self.state.lock().await.violations.remove(identity_key);
        Ok(())
    }

    async fn get_ban(&self, identity_key: &str) -> AppResult<Option<BanRecord>> {
        self.guard().await?;
        Ok(self.state.lock().await.bans.get(identity_key).cloned())
    }

    async fn put_ban(&self, record: BanRecord) -> AppResult<()> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        let merged = match state.bans.remove(&record.identity_key) {
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
        self.guard().await?;
        let mut state = self.state.lock().await;
        let initial = state.windows.len() + state.violations.len() + state.bans.len();
        state
            .windows
            .retain(|_, window| window.window_started_at >= before);
        state.violations.retain(|_, (started, _)| *started >= before);
        state.bans.retain(|_, ban| ban.expires_at >= before);
        let remaining = state.windows.len() + state.violations.len() + state.bans.len();
        Ok(u64::try_from(initial - remaining).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl NonceRepository for FakeSecurityStore {
    async fn is_nonce_consumed(&self, nonce: &str, now: DateTime<Utc>) -> AppResult<bool> {
        self.guard().await?;
        Ok(self
            .state
            .lock()
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
        self.guard().await?;
        let mut state = self.state.lock().await;
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
        self.guard().await?;
        let mut state = self.state.lock().await;
        let initial = state.nonces.len();
        state.nonces.retain(|_, expires_at| *expires_at > now);
        Ok(u64::try_from(initial - state.nonces.len()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl ThreatEventRepository for FakeSecurityStore {
    async fn put_threat_event(&self, event: ThreatEvent) -> AppResult<()> {
        self.guard().await?;
        self.state.lock().await.threat_events.push(event);
        Ok(())
    }

    async fn find_threat_event(&self, id: Uuid) -> AppResult<Option<ThreatEvent>> {
        self.guard().await?;
        Ok(self
            .state
            .lock()
            .await
            .threat_events
            .iter()
            .find(|event| event.id == id)
            .cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: ThreatStatus,
        next: ThreatStatus,
    ) -> AppResult<bool> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state
            .threat_events
            .iter_mut()
            .find(|event| event.id == id && event.status == expected)
        {
            Some(event) => {
                event.status = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query_threat_events(&self, query: &ThreatEventQuery) -> AppResult<Vec<ThreatEvent>> {
        self.guard().await?;
        let mut events: Vec<ThreatEvent> = self
            .state
            .lock()
            .await
            .threat_events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        events.sort_by(|left, right| right.detected_at.cmp(&left.detected_at));
        events.truncate(usize::try_from(query.effective_limit()).unwrap_or(usize::MAX));
        Ok(events)
    }
}
