//! Time and randomness sources.
//!
//! Every component takes its clock and random source by injection so tests can
//! drive lockout windows, token expiry and counter resets deterministically.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::sync::Mutex;

/// Longest configurable duration (ten years). Keeps `now + duration` far from
/// the `chrono` range limits.
pub const MAX_DURATION_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Clamp a configured number of seconds into `1..=MAX_DURATION_SECONDS`.
#[must_use]
pub fn bounded_seconds(seconds: i64) -> i64 {
    seconds.clamp(1, MAX_DURATION_SECONDS)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub trait RandomSource: Send + Sync {
    /// Fill `buf` with cryptographically secure bytes.
    ///
    /// # Errors
    /// Returns an error if the underlying entropy source fails.
    fn fill(&self, buf: &mut [u8]) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .context("failed to read from the OS random source")
    }
}
