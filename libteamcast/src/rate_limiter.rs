//! Per-platform dispatch quotas
//!
//! Each platform gets a fixed window of `window_duration` aligned to the Unix
//! epoch and may be granted `limit` acquisitions inside it. Platforms never
//! share state: each window sits behind its own lock, so acquisitions for one
//! platform serialize while different platforms proceed independently.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::config::{Config, RateLimitConfig};

/// Quota window of one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub window_start: DateTime<Utc>,
    pub used_count: u32,
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            window_start: DateTime::<Utc>::default(),
            used_count: 0,
            limit: config.limit,
            window_secs: config.window_secs,
        }
    }

    pub fn window_duration(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + self.window_duration()
    }

    /// Move to the window containing `now`, resetting the count on change
    fn roll(&mut self, now: DateTime<Utc>) {
        let start = window_start_for(now, self.window_secs);
        if start != self.window_start {
            self.window_start = start;
            self.used_count = 0;
        }
    }
}

/// Floor `now` to a multiple of the window length
fn window_start_for(now: DateTime<Utc>, window_secs: u64) -> DateTime<Utc> {
    let window = window_secs.max(1) as i64;
    let secs = now.timestamp().div_euclid(window) * window;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(now)
}

/// Outcome of asking for a dispatch slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Denied; ask again once `retry_after` has elapsed
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Granted => None,
            Admission::Denied { retry_after } => Some(*retry_after),
        }
    }
}

/// Rate limiter for platform dispatch
pub struct RateLimiter {
    windows: HashMap<String, Mutex<RateLimitState>>,
}

impl RateLimiter {
    /// Create a rate limiter with one window per configured platform
    pub fn new(limits: HashMap<String, RateLimitConfig>) -> Self {
        let windows = limits
            .iter()
            .map(|(platform, config)| (platform.clone(), Mutex::new(RateLimitState::new(config))))
            .collect();
        Self { windows }
    }

    pub fn from_config(config: &Config) -> Self {
        let limits = config
            .platforms
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| (name.clone(), p.rate_limit))
            .collect();
        Self::new(limits)
    }

    /// Take one slot for `platform` if the current window has room
    ///
    /// Platforms without a configured limit are always granted.
    pub fn try_acquire(&self, platform: &str, now: DateTime<Utc>) -> Admission {
        let Some(window) = self.windows.get(platform) else {
            return Admission::Granted;
        };
        let mut state = window.lock().unwrap_or_else(|e| e.into_inner());
        state.roll(now);

        if state.used_count < state.limit {
            state.used_count += 1;
            debug!(
                platform,
                used = state.used_count,
                limit = state.limit,
                "rate limit slot granted"
            );
            return Admission::Granted;
        }

        let retry_after = state.window_end() - now;
        debug!(
            platform,
            retry_after_ms = retry_after.num_milliseconds(),
            "rate limit window exhausted"
        );
        Admission::Denied { retry_after }
    }

    /// Hand back a slot taken at `acquired_at` for work that never started
    ///
    /// Slots from an earlier window are gone with that window.
    pub fn release(&self, platform: &str, acquired_at: DateTime<Utc>) {
        let Some(window) = self.windows.get(platform) else {
            return;
        };
        let mut state = window.lock().unwrap_or_else(|e| e.into_inner());
        if state.window_start == window_start_for(acquired_at, state.window_secs) {
            state.used_count = state.used_count.saturating_sub(1);
        }
    }

    /// Check whether a slot is available without taking it
    pub fn check(&self, platform: &str, now: DateTime<Utc>) -> Admission {
        let Some(window) = self.windows.get(platform) else {
            return Admission::Granted;
        };
        let mut state = *window.lock().unwrap_or_else(|e| e.into_inner());
        state.roll(now);
        if state.used_count < state.limit {
            Admission::Granted
        } else {
            Admission::Denied {
                retry_after: state.window_end() - now,
            }
        }
    }

    /// Current window of `platform`, for persistence
    pub fn state(&self, platform: &str) -> Option<RateLimitState> {
        self.windows
            .get(platform)
            .map(|w| *w.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Reload a persisted window
    ///
    /// Stored windows whose shape no longer matches the configuration are
    /// ignored; the configured limit always wins.
    pub fn restore(&self, platform: &str, stored: RateLimitState) -> bool {
        let Some(window) = self.windows.get(platform) else {
            return false;
        };
        let mut state = window.lock().unwrap_or_else(|e| e.into_inner());
        if stored.window_secs != state.window_secs {
            return false;
        }
        state.window_start = stored.window_start;
        state.used_count = stored.used_count.min(state.limit);
        true
    }
}
