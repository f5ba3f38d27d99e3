// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sequence monotonicity, rate limiting, and freshness gating (§4.3).
//!
//! Runs after [`crate::intent::IntentValidator::validate`] accepts a frame.
//! Like the validator, this is a pure decisioner: the Broker stores the
//! intent and advances `lastSequence`/`lastAcceptedAt` only after a decision
//! comes back accepted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::SharedClock;

/// Per-controller sequence/rate-limit state (§3 intent store).
#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    last_sequence: u64,
    last_accepted_at_ms: u64,
    has_accepted: bool,
}

/// Why a frame was rejected by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Regression,
    RateLimited,
    Stale,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::RateLimited => "rate_limited",
            Self::Stale => "stale",
        }
    }
}

/// Tagged decision returned by [`IntentGate::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub accepted: bool,
    pub reason: Option<GateReason>,
    pub delay: Option<Duration>,
}

impl GateDecision {
    fn accept() -> Self {
        Self { accepted: true, reason: None, delay: None }
    }

    fn reject(reason: GateReason, delay: Option<Duration>) -> Self {
        Self { accepted: false, reason: Some(reason), delay }
    }
}

/// A single inbound intent frame as seen by the gate.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub sequence_id: u64,
    pub sent_at_ms: Option<u64>,
}

/// Per-controller sequence and cadence gate (§4.3).
pub struct IntentGate {
    min_interval: Duration,
    max_age: Duration,
    clock: SharedClock,
    state: Mutex<HashMap<String, GateState>>,
}

impl IntentGate {
    pub fn new(min_interval: Duration, max_age: Duration, clock: SharedClock) -> Self {
        Self { min_interval, max_age, clock, state: Mutex::new(HashMap::new()) }
    }

    /// Evaluate and, on acceptance, advance `controller_id`'s sequence and
    /// cadence bookkeeping. Rejection never mutates state.
    pub fn evaluate(&self, controller_id: &str, frame: Frame) -> GateDecision {
        let now = self.clock.now_ms();
        let mut map = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = map.entry(controller_id.to_owned()).or_default();

        if entry.has_accepted && frame.sequence_id <= entry.last_sequence {
            return GateDecision::reject(GateReason::Regression, None);
        }

        if !self.min_interval.is_zero() && entry.has_accepted {
            let elapsed = now.saturating_sub(entry.last_accepted_at_ms);
            let min_interval_ms = self.min_interval.as_millis() as u64;
            if elapsed < min_interval_ms {
                let delay = Duration::from_millis(min_interval_ms - elapsed);
                return GateDecision::reject(GateReason::RateLimited, Some(delay));
            }
        }

        if let Some(sent_at) = frame.sent_at_ms {
            if !self.max_age.is_zero() {
                let age = now.saturating_sub(sent_at);
                if age > self.max_age.as_millis() as u64 {
                    return GateDecision::reject(GateReason::Stale, None);
                }
            }
        }

        entry.last_sequence = frame.sequence_id;
        entry.last_accepted_at_ms = now;
        entry.has_accepted = true;
        GateDecision::accept()
    }

    /// Drop all gate state for `controller_id` (companion to
    /// [`crate::intent::IntentValidator::forget`], called with the same
    /// `"{client_id}|{controller_id}"` key on disconnect).
    pub fn forget(&self, controller_id: &str) {
        let mut map = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(controller_id);
    }
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
