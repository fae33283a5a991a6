//! C1: Clock abstraction and business-hours gate.
//!
//! Monotonic scheduling decisions (retry backoff, cache TTLs) must never be
//! driven by wall-clock `DateTime`, which
//! can jump on NTP correction or DST transition. `Clock` splits the two:
//! `now()` gives wall-clock time for display/persistence, `monotonic_now()`
//! gives an `Instant` for interval math. Tests inject `FixedClock` instead of
//! sleeping or reading the system clock, injecting fakes at construction
//! rather than patching globals.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::config::BusinessHoursConfig;

/// Injectable time source. `Send + Sync` so it can live behind an `Arc` and
/// cross task boundaries the same way `DatabaseManager` does.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic_now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Test double: wall-clock time is set explicitly and never advances on its
/// own; monotonic time advances with it via `advance()`.
pub struct FixedClock {
    inner: Mutex<FixedClockState>,
}

struct FixedClockState {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl FixedClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self { inner: Mutex::new(FixedClockState { wall, mono: Instant::now() }) }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut state = self.inner.lock();
        state.wall += delta;
        if let Ok(std_delta) = delta.to_std() {
            state.mono += std_delta;
        }
    }

    pub fn set(&self, wall: DateTime<Utc>) {
        self.inner.lock().wall = wall;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().wall
    }

    fn monotonic_now(&self) -> Instant {
        self.inner.lock().mono
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Business-hours gate: decides whether a given instant falls inside
/// the tenant's configured operating window, in the tenant's own time zone.
pub struct BusinessHoursGate {
    config: BusinessHoursConfig,
    tz: Tz,
}

impl BusinessHoursGate {
    pub fn new(config: BusinessHoursConfig) -> Self {
        let tz: Tz = config.timezone.parse().unwrap_or(chrono_tz::Europe::Berlin);
        Self { config, tz }
    }

    /// True if `at` (UTC) falls within an open day/hour window.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz);
        if !self.config.open_days.contains(&local.weekday()) {
            return false;
        }
        let hour = local.hour();
        hour >= self.config.open_hour && hour < self.config.close_hour
    }

    /// Next instant (UTC) at or after `at` that falls inside business hours.
    pub fn next_open(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = at;
        for _ in 0..8 {
            if self.is_open(candidate) {
                return candidate;
            }
            let local = candidate.with_timezone(&self.tz);
            let next_local = if local.hour() < self.config.open_hour {
                local
                    .date_naive()
                    .and_hms_opt(self.config.open_hour, 0, 0)
                    .unwrap()
                    .and_local_timezone(self.tz)
                    .single()
            } else {
                (local.date_naive() + chrono::Duration::days(1))
                    .and_hms_opt(self.config.open_hour, 0, 0)
                    .unwrap()
                    .and_local_timezone(self.tz)
                    .single()
            };
            candidate = match next_local {
                Some(dt) => dt.with_timezone(&Utc),
                None => candidate + chrono::Duration::hours(1),
            };
        }
        candidate
    }
}
