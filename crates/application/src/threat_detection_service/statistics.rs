//! Bounded in-process working cache of per-identity and per-origin traffic.
//!
//! The cache only sharpens detection; losing it (restart, eviction) makes the
//! traffic rules quieter, never stricter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{AuthOutcome, RequestEvent};

use super::config::ThreatDetectionConfig;

/// Largest number of geographies remembered per identity.
const MAX_KNOWN_GEOS: usize = 32;

/// An eviction pass frees this share (1/n) of capacity so the next
/// passes are spread over many inserts.
const EVICTION_HEADROOM_DIVISOR: usize = 10;

/// Request velocity for one identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocitySample {
    /// Requests in the current velocity window, including this one.
    pub count: u32,
    /// Learned baseline for one window, floored at the configured minimum.
    pub baseline: f64,
}

/// Authentication failures recorded for one network origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureSample {
    /// Failures inside the credential window.
    pub failures: u32,
    /// Distinct identities among those failures.
    pub distinct_identities: u32,
}

/// Access history for one identity, measured before this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySample {
    /// Earlier observations of this identity.
    pub observations: u64,
    /// True when the event carries a geography never seen for this identity.
    pub geo_is_new: bool,
    /// Distinct paths inside the fan-out window, including this one.
    pub distinct_recent_paths: u32,
}

/// Statistics visible to the traffic rules for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficSnapshot {
    /// Present when the event names an identity.
    pub velocity: Option<VelocitySample>,
    /// Present when the event is an authentication failure with an origin.
    pub origin_failures: Option<FailureSample>,
    /// Present when the event names an identity.
    pub history: Option<HistorySample>,
}

#[derive(Debug)]
struct IdentityProfile {
    window_requests: VecDeque<DateTime<Utc>>,
    bucket_started_at: DateTime<Utc>,
    bucket_count: u32,
    baseline: Option<f64>,
    observations: u64,
    known_geos: HashSet<String>,
    recent_paths: VecDeque<(DateTime<Utc>, String)>,
    last_seen: DateTime<Utc>,
}

impl IdentityProfile {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_requests: VecDeque::new(),
            bucket_started_at: now,
            bucket_count: 0,
            baseline: None,
            observations: 0,
            known_geos: HashSet::new(),
            recent_paths: VecDeque::new(),
            last_seen: now,
        }
    }
}

#[derive(Debug)]
struct OriginProfile {
    failures: VecDeque<(DateTime<Utc>, String)>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StatisticsState {
    identities: HashMap<String, IdentityProfile>,
    origins: HashMap<String, OriginProfile>,
    eviction_passes: u64,
}

/// Thread-safe traffic statistics shared by all detector clones.
#[derive(Debug)]
pub struct TrafficStatistics {
    state: Mutex<StatisticsState>,
    velocity_window: Duration,
    credential_window: Duration,
    fanout_window: Duration,
    idle_ttl: Duration,
    min_baseline: f64,
    smoothing: f64,
    max_tracked_keys: usize,
}

impl TrafficStatistics {
    /// Creates an empty cache sized by the detection configuration.
    #[must_use]
    pub fn new(config: &ThreatDetectionConfig) -> Self {
        Self {
            state: Mutex::new(StatisticsState::default()),
            velocity_window: Duration::seconds(i64::from(config.velocity_window_seconds)),
            credential_window: Duration::seconds(i64::from(config.credential_window_seconds)),
            fanout_window: Duration::seconds(i64::from(config.fanout_window_seconds)),
            idle_ttl: Duration::seconds(i64::from(config.idle_ttl_seconds)),
            min_baseline: config.velocity_min_baseline,
            smoothing: config.baseline_smoothing,
            max_tracked_keys: config.max_tracked_keys,
        }
    }

    /// Records an event and returns the statistics the rules should see.
    pub fn observe(&self, event: &RequestEvent, now: DateTime<Utc>) -> AppResult<TrafficSnapshot> {
        let mut state = self.state.lock().map_err(|error| {
            AppError::Internal(format!("failed to lock traffic statistics: {error}"))
        })?;

        let identity_key = non_blank(event.identity_key.as_deref());
        let origin = non_blank(event.origin.as_deref());

        let mut snapshot = TrafficSnapshot::default();

        if let Some(identity_key) = identity_key {
            let profile = state
                .identities
                .entry(identity_key.to_owned())
                .or_insert_with(|| IdentityProfile::new(now));
            let (velocity, history) = self.observe_identity(profile, event, now);
            snapshot.velocity = Some(velocity);
            snapshot.history = Some(history);
        }

        if let (Some(origin), Some(AuthOutcome::Failure)) = (origin, event.auth_outcome) {
            let profile = state
                .origins
                .entry(origin.to_owned())
                .or_insert_with(|| OriginProfile {
                    failures: VecDeque::new(),
                    last_seen: now,
                });
            snapshot.origin_failures = Some(self.observe_failure(
                profile,
                identity_key.unwrap_or("unknown"),
                now,
            ));
        }

        self.evict(&mut state, now);

        Ok(snapshot)
    }

    /// Returns how many identities and origins are cached.
    pub fn tracked_keys(&self) -> AppResult<usize> {
        let state = self.state.lock().map_err(|error| {
            AppError::Internal(format!("failed to lock traffic statistics: {error}"))
        })?;

        Ok(state.identities.len() + state.origins.len())
    }

    fn observe_identity(
        &self,
        profile: &mut IdentityProfile,
        event: &RequestEvent,
        now: DateTime<Utc>,
    ) -> (VelocitySample, HistorySample) {
        let observations = profile.observations;
        profile.observations = profile.observations.saturating_add(1);
        profile.last_seen = profile.last_seen.max(now);

        if now - profile.bucket_started_at >= self.velocity_window {
            let completed = f64::from(profile.bucket_count);
            profile.baseline = Some(match profile.baseline {
                Some(previous) => previous + self.smoothing * (completed - previous),
                None => completed,
            });
            profile.bucket_started_at = now;
            profile.bucket_count = 0;
        }
        profile.bucket_count = profile.bucket_count.saturating_add(1);

        profile.window_requests.push_back(now);
        while profile
            .window_requests
            .front()
            .is_some_and(|seen| now - *seen >= self.velocity_window)
        {
            profile.window_requests.pop_front();
        }

        let velocity = VelocitySample {
            count: u32::try_from(profile.window_requests.len()).unwrap_or(u32::MAX),
            baseline: profile
                .baseline
                .unwrap_or(self.min_baseline)
                .max(self.min_baseline),
        };

        let geo = non_blank(event.geo.as_deref()).map(str::to_ascii_uppercase);
        let geo_is_new = geo.as_ref().is_some_and(|geo| {
            !profile.known_geos.is_empty() && !profile.known_geos.contains(geo)
        });
        if let Some(geo) = geo {
            if profile.known_geos.len() < MAX_KNOWN_GEOS {
                profile.known_geos.insert(geo);
            }
        }

        if let Some(path) = non_blank(event.path.as_deref()) {
            profile.recent_paths.push_back((now, path.to_owned()));
        }
        while profile
            .recent_paths
            .front()
            .is_some_and(|(seen, _)| now - *seen >= self.fanout_window)
        {
            profile.recent_paths.pop_front();
        }
        let distinct_recent_paths = profile
            .recent_paths
            .iter()
            .map(|(_, path)| path.as_str())
            .collect::<HashSet<_>>()
            .len();

        let history = HistorySample {
            observations,
            geo_is_new,
            distinct_recent_paths: u32::try_from(distinct_recent_paths).unwrap_or(u32::MAX),
        };

        (velocity, history)
    }

    fn observe_failure(
        &self,
        profile: &mut OriginProfile,
        identity_key: &str,
        now: DateTime<Utc>,
    ) -> FailureSample {
        profile.last_seen = profile.last_seen.max(now);
        profile.failures.push_back((now, identity_key.to_owned()));
        while profile
            .failures
            .front()
            .is_some_and(|(seen, _)| now - *seen >= self.credential_window)
        {
            profile.failures.pop_front();
        }

        let distinct_identities = profile
            .failures
            .iter()
            .map(|(_, identity)| identity.as_str())
            .collect::<HashSet<_>>()
            .len();

        FailureSample {
            failures: u32::try_from(profile.failures.len()).unwrap_or(u32::MAX),
            distinct_identities: u32::try_from(distinct_identities).unwrap_or(u32::MAX),
        }
    }

    fn evict(&self, state: &mut StatisticsState, now: DateTime<Utc>) {
        if state.identities.len() + state.origins.len() <= self.max_tracked_keys {
            return;
        }
        state.eviction_passes = state.eviction_passes.saturating_add(1);

        let idle_ttl = self.idle_ttl;
        state
            .identities
            .retain(|_, profile| now - profile.last_seen < idle_ttl);
        state
            .origins
            .retain(|_, profile| now - profile.last_seen < idle_ttl);

        let low_water = self.max_tracked_keys - self.max_tracked_keys / EVICTION_HEADROOM_DIVISOR;
        let overflow = (state.identities.len() + state.origins.len()).saturating_sub(low_water);
        if overflow == 0 {
            return;
        }

        let doomed: Vec<(bool, String)> = {
            let mut candidates: Vec<(DateTime<Utc>, bool, &String)> = state
                .identities
                .iter()
                .map(|(key, profile)| (profile.last_seen, true, key))
                .chain(
                    state
                        .origins
                        .iter()
                        .map(|(key, profile)| (profile.last_seen, false, key)),
                )
                .collect();
            if overflow < candidates.len() {
                candidates.select_nth_unstable(overflow);
                candidates.truncate(overflow);
            }
            candidates
                .into_iter()
                .map(|(_, is_identity, key)| (is_identity, key.clone()))
                .collect()
        };

        debug!(
            evicted = doomed.len(),
            eviction_passes = state.eviction_passes,
            "traffic statistics trimmed"
        );
        for (is_identity, key) in doomed {
            if is_identity {
                state.identities.remove(&key);
            } else {
                state.origins.remove(&key);
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use fleetguard_domain::RequestEvent;

    use super::TrafficStatistics;
    use crate::threat_detection_service::ThreatDetectionConfig;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn renter(index: i64) -> RequestEvent {
        RequestEvent {
            identity_key: Some(format!("net:198.51.100.{}:{index}", index % 250)),
            path: Some("/v1/bookings".to_owned()),
            ..RequestEvent::default()
        }
    }

    fn passes(statistics: &TrafficStatistics) -> u64 {
        let Ok(state) = statistics.state.lock() else {
            panic!("statistics lock must not be poisoned");
        };
        state.eviction_passes
    }

    #[test]
    fn eviction_at_capacity_runs_in_batches() {
        let statistics = TrafficStatistics::new(&ThreatDetectionConfig {
            max_tracked_keys: 1_000,
            ..ThreatDetectionConfig::default()
        });

        for index in 0..1_000 {
            let observed = statistics.observe(&renter(index), t0() + Duration::milliseconds(index));
            assert!(observed.is_ok());
        }
        assert_eq!(passes(&statistics), 0);

        for index in 1_000..2_000 {
            let observed = statistics.observe(&renter(index), t0() + Duration::milliseconds(index));
            assert!(observed.is_ok());
        }

        assert!(passes(&statistics) <= 10, "passes: {}", passes(&statistics));
        let Ok(tracked) = statistics.tracked_keys() else {
            panic!("statistics must be readable");
        };
        assert!(tracked <= 1_000);
        assert!(tracked >= 900);
    }

    #[test]
    fn eviction_drops_the_least_recently_seen_keys() {
        let statistics = TrafficStatistics::new(&ThreatDetectionConfig {
            max_tracked_keys: 10,
            ..ThreatDetectionConfig::default()
        });

        for index in 0..11 {
            let observed = statistics.observe(&renter(index), t0() + Duration::seconds(index));
            assert!(observed.is_ok());
        }

        let Ok(state) = statistics.state.lock() else {
            panic!("statistics lock must not be poisoned");
        };
        assert_eq!(state.identities.len(), 9);
        assert!(!state.identities.contains_key("net:198.51.100.0:0"));
        assert!(!state.identities.contains_key("net:198.51.100.1:1"));
        assert!(state.identities.contains_key("net:198.51.100.10:10"));
    }
}
