//! Rate limit windows, thresholds, bans, and decisions.

use chrono::{DateTime, Duration, Utc};
use fleetguard_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Tier-specific limits applied to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThresholds {
    /// Maximum requests allowed in the main window.
    pub requests_per_window: u32,
    /// Main window length in seconds.
    pub window_seconds: u32,
    /// Maximum requests allowed in the burst sub-window.
    pub burst_ceiling: u32,
    /// Burst sub-window length in seconds.
    pub burst_window_seconds: u32,
}

impl TierThresholds {
    /// Creates validated thresholds.
    pub fn new(
        requests_per_window: u32,
        window_seconds: u32,
        burst_ceiling: u32,
        burst_window_seconds: u32,
    ) -> AppResult<Self> {
        if requests_per_window == 0 || burst_ceiling == 0 {
            return Err(AppError::Validation(
                "rate limit ceilings must be greater than zero".to_owned(),
            ));
        }

        if window_seconds == 0 || burst_window_seconds == 0 {
            return Err(AppError::Validation(
                "rate limit windows must be greater than zero".to_owned(),
            ));
        }

        if burst_window_seconds > window_seconds {
            return Err(AppError::Validation(format!(
                "burst window ({burst_window_seconds}s) must not exceed the main window ({window_seconds}s)"
            )));
        }

        Ok(Self {
            requests_per_window,
            window_seconds,
            burst_ceiling,
            burst_window_seconds,
        })
    }

    /// Parses the compact `"{requests}/{seconds},{burst}/{seconds}"` notation.
    pub fn parse(value: &str) -> AppResult<Self> {
        let (window, burst) = value.split_once(',').ok_or_else(|| {
            AppError::Validation(format!(
                "rate limit thresholds '{value}' must look like '100/60,10/5'"
            ))
        })?;
        let (requests_per_window, window_seconds) = parse_fraction(window)?;
        let (burst_ceiling, burst_window_seconds) = parse_fraction(burst)?;

        Self::new(
            requests_per_window,
            window_seconds,
            burst_ceiling,
            burst_window_seconds,
        )
    }
}

fn parse_fraction(value: &str) -> AppResult<(u32, u32)> {
    let (count, seconds) = value.trim().split_once('/').ok_or_else(|| {
        AppError::Validation(format!("'{value}' must look like '<count>/<seconds>'"))
    })?;
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|error| AppError::Validation(format!("invalid count '{count}': {error}")))?;
    let seconds = seconds
        .trim()
        .parse::<u32>()
        .map_err(|error| AppError::Validation(format!("invalid seconds '{seconds}': {error}")))?;

    Ok((count, seconds))
}

/// Counter state for one identity as stored after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    /// Start of the main window. Only ever moves forward.
    pub window_started_at: DateTime<Utc>,
    /// Requests counted in the main window, including the current one.
    pub count: u32,
    /// Start of the burst sub-window.
    pub burst_started_at: DateTime<Utc>,
    /// Requests counted in the burst sub-window.
    pub burst_count: u32,
}

impl RateLimitWindow {
    /// Creates the window for the first request seen at `now`.
    #[must_use]
    pub fn opened_at(now: DateTime<Utc>) -> Self {
        Self {
            window_started_at: now,
            count: 1,
            burst_started_at: now,
            burst_count: 1,
        }
    }

    /// Applies one request at `now`, rolling either window when it has elapsed.
    ///
    /// Stores that cannot run this logic natively must reproduce it atomically.
    #[must_use]
    pub fn advanced(self, thresholds: &TierThresholds, now: DateTime<Utc>) -> Self {
        let (window_started_at, count) = roll(
            self.window_started_at,
            self.count,
            thresholds.window_seconds,
            now,
        );
        let (burst_started_at, burst_count) = roll(
            self.burst_started_at,
            self.burst_count,
            thresholds.burst_window_seconds,
            now,
        );

        Self {
            window_started_at,
            count,
            burst_started_at,
            burst_count,
        }
    }

    /// Seconds until the main window rolls over, at least one.
    #[must_use]
    pub fn window_retry_after(&self, thresholds: &TierThresholds, now: DateTime<Utc>) -> u64 {
        remaining_seconds(self.window_started_at, thresholds.window_seconds, now)
    }

    /// Seconds until the burst sub-window rolls over, at least one.
    #[must_use]
    pub fn burst_retry_after(&self, thresholds: &TierThresholds, now: DateTime<Utc>) -> u64 {
        remaining_seconds(self.burst_started_at, thresholds.burst_window_seconds, now)
    }
}

fn roll(
    started_at: DateTime<Utc>,
    count: u32,
    length_seconds: u32,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, u32) {
    if now - started_at >= Duration::seconds(i64::from(length_seconds)) {
        (now, 1)
    } else {
        (started_at, count.saturating_add(1))
    }
}

fn remaining_seconds(started_at: DateTime<Utc>, length_seconds: u32, now: DateTime<Utc>) -> u64 {
    let elapsed = (now - started_at).num_seconds().max(0);
    let remaining = i64::from(length_seconds) - elapsed;
    u64::try_from(remaining).unwrap_or(0).max(1)
}

/// Active or historical ban for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    /// Storage key of the banned identity.
    pub identity_key: String,
    /// Human-readable reason kept for review.
    pub reason: String,
    /// When the ban was issued.
    pub banned_at: DateTime<Utc>,
    /// When the ban stops applying.
    pub expires_at: DateTime<Utc>,
    /// Number of consecutive offenses this ban represents, starting at one.
    pub offense_count: u32,
}

impl BanRecord {
    /// Returns true while the ban still applies. Expiry is evaluated lazily.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Returns the duration this ban was issued for.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.expires_at - self.banned_at
    }
}

/// Behavior when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the request.
    Open,
    /// Deny the request.
    Closed,
}

impl FailurePolicy {
    /// Returns a stable configuration value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(AppError::Validation(format!(
                "failure policy must be 'open' or 'closed', got '{value}'"
            ))),
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateLimitDecision {
    /// Request may proceed.
    Allow,
    /// Request exceeded a ceiling; retry after the given delay.
    Throttle {
        /// Seconds until the caller may retry.
        retry_after_seconds: u64,
    },
    /// Identity is banned until the given instant.
    Banned {
        /// Ban expiry.
        until: DateTime<Utc>,
    },
}

impl RateLimitDecision {
    /// Returns true when the request may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}
