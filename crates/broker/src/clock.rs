// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Abstract time source, injectable so the validator/gate/tick-loop tests in
//! this crate can advance time deterministically instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of monotonic-enough wall-clock time, in milliseconds since the
/// Unix epoch. `SystemClock` reads real time; `TestClock` is a settable
/// counter for property and scenario tests (see §8 S3/S5).
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A settable clock for tests. Cloning shares the same underlying counter.
#[derive(Clone)]
pub struct TestClock {
    millis: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new(start_ms: u64) -> Self {
        Self { millis: Arc::new(AtomicU64::new(start_ms)) }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A shared, dynamically-dispatched clock handle passed to every component
/// that needs `now()` (IntentValidator, IntentGate, TokenVerifier, the tick
/// loop, BandwidthRegulator).
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
