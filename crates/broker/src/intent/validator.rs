// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Range, per-frame delta, invalid-burst, and cooldown state machine (§4.2).
//!
//! Per-entry state lives behind the validator's own lock and is never held
//! across I/O, matching the partitioning rule in §5.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::SharedClock;

/// The four checked control channels, in the fixed evaluation order used by
/// both range and delta checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Controls {
    pub throttle: f64,
    pub brake: f64,
    pub steer: f64,
    pub gear: i32,
    pub handbrake: bool,
    pub boost: bool,
}

/// Per-channel configuration: inclusive range and max per-frame delta.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    pub min: f64,
    pub max: f64,
    pub delta_max: f64,
}

/// Tunable parameters for the validator, all overridable from their §4.2
/// defaults.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorLimits {
    pub throttle: ChannelLimits,
    pub brake: ChannelLimits,
    pub steer: ChannelLimits,
    pub gear: ChannelLimits,
    pub invalid_burst_window: Duration,
    pub invalid_burst_limit: u32,
    pub cooldown_duration: Duration,
    pub max_cooldown_strikes: u32,
}

/// Tolerance added to every delta comparison, per §4.2 step 4.
const DELTA_TOLERANCE: f64 = 1e-9;

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            throttle: ChannelLimits { min: -1.0, max: 1.0, delta_max: 0.35 },
            brake: ChannelLimits { min: 0.0, max: 1.0, delta_max: 0.50 },
            steer: ChannelLimits { min: -1.0, max: 1.0, delta_max: 0.45 },
            gear: ChannelLimits { min: -1.0, max: 9.0, delta_max: 1.0 },
            invalid_burst_window: Duration::from_secs(1),
            invalid_burst_limit: 5,
            cooldown_duration: Duration::from_millis(500),
            max_cooldown_strikes: 3,
        }
    }
}

/// Tagged decision returned by [`IntentValidator::validate`]. Mutually
/// exclusive outcome fields per §9's "tagged variants over inheritance".
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationDecision {
    pub accepted: bool,
    pub reason: Option<ValidationReason>,
    pub warn: bool,
    pub disconnect: bool,
    pub cooldown: Option<Duration>,
}

impl ValidationDecision {
    fn accept() -> Self {
        Self { accepted: true, reason: None, warn: false, disconnect: false, cooldown: None }
    }
}

/// Reasons a frame can be rejected. Range reasons are named per-channel so
/// callers can increment the exact counter §8 invariant 2 requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    ThrottleRange,
    BrakeRange,
    SteerRange,
    GearRange,
    ThrottleDelta,
    BrakeDelta,
    SteerDelta,
    GearDelta,
    CooldownActive,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThrottleRange => "throttle_range",
            Self::BrakeRange => "brake_range",
            Self::SteerRange => "steer_range",
            Self::GearRange => "gear_range",
            Self::ThrottleDelta => "throttle_delta",
            Self::BrakeDelta => "brake_delta",
            Self::SteerDelta => "steer_delta",
            Self::GearDelta => "gear_delta",
            Self::CooldownActive => "cooldown_active",
        }
    }
}

/// Per `clientID|controllerID` state (§3 ValidatorClientState).
#[derive(Debug, Clone, Default)]
struct ClientState {
    last_controls: Option<Controls>,
    first_invalid_ms: u64,
    invalid_count: u32,
    cooldown_until_ms: u64,
    strikes: u32,
}

/// Pure range/delta/cooldown validator keyed by `clientID|controllerID`.
pub struct IntentValidator {
    limits: ValidatorLimits,
    clock: SharedClock,
    state: Mutex<HashMap<String, ClientState>>,
}

fn key(client_id: &str, controller_id: &str) -> String {
    format!("{client_id}|{controller_id}")
}

impl IntentValidator {
    pub fn new(limits: ValidatorLimits, clock: SharedClock) -> Self {
        Self { limits, clock, state: Mutex::new(HashMap::new()) }
    }

    /// Validate a frame's controls for `client_id|controller_id` (§4.2
    /// algorithm). Does not mutate `last_controls` on acceptance — callers
    /// must call [`Self::commit`] after performing their own side effects.
    pub fn validate(&self, client_id: &str, controller_id: &str, controls: Controls) -> ValidationDecision {
        let now = self.clock.now_ms();
        let k = key(client_id, controller_id);
        let mut map = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = map.entry(k).or_default();

        if entry.cooldown_until_ms > now {
            let remaining = Duration::from_millis(entry.cooldown_until_ms - now);
            return ValidationDecision {
                accepted: false,
                reason: Some(ValidationReason::CooldownActive),
                warn: false,
                disconnect: false,
                cooldown: Some(remaining),
            };
        }

        let violation = self.range_violation(&controls).or_else(|| {
            if entry.last_controls.is_some() {
                self.delta_violation(entry.last_controls.as_ref(), &controls)
            } else {
                None
            }
        });

        let Some(reason) = violation else {
            return ValidationDecision::accept();
        };

        Self::record_burst(entry, now, self.limits.invalid_burst_window);

        let mut warn = false;
        let mut disconnect = false;
        let mut cooldown = None;

        if entry.invalid_count == self.limits.invalid_burst_limit.saturating_sub(1) {
            warn = true;
        }
        if entry.invalid_count >= self.limits.invalid_burst_limit {
            entry.cooldown_until_ms = now + self.limits.cooldown_duration.as_millis() as u64;
            entry.invalid_count = 0;
            entry.first_invalid_ms = 0;
            entry.strikes += 1;
            cooldown = Some(self.limits.cooldown_duration);
            if entry.strikes >= self.limits.max_cooldown_strikes {
                disconnect = true;
            }
        }

        ValidationDecision { accepted: false, reason: Some(reason), warn, disconnect, cooldown }
    }

    /// Record the acceptance side effect: replace `last_controls`, mark
    /// `hasLast`, clear the invalid burst. Must be called by the caller on
    /// every accepted frame (§4.2 step 6).
    pub fn commit(&self, client_id: &str, controller_id: &str, controls: Controls) {
        let k = key(client_id, controller_id);
        let mut map = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = map.entry(k).or_default();
        entry.last_controls = Some(controls);
        entry.invalid_count = 0;
        entry.first_invalid_ms = 0;
    }

    /// Delete every state entry for `client_id`: the entry keyed exactly
    /// `client_id` (possible when `controller_id` is empty) and every entry
    /// whose key starts with `"{client_id}|"`. See DESIGN.md's Open
    /// Question decision: this is exact-prefix matching, so a client ID
    /// that is a textual prefix of another client's ID is never affected.
    pub fn forget(&self, client_id: &str) {
        let prefix = format!("{client_id}|");
        let mut map = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.retain(|k, _| k != client_id && !k.starts_with(&prefix));
    }

    fn range_violation(&self, controls: &Controls) -> Option<ValidationReason> {
        if !in_range(controls.throttle, self.limits.throttle) {
            return Some(ValidationReason::ThrottleRange);
        }
        if !in_range(controls.brake, self.limits.brake) {
            return Some(ValidationReason::BrakeRange);
        }
        if !in_range(controls.steer, self.limits.steer) {
            return Some(ValidationReason::SteerRange);
        }
        if !in_range(f64::from(controls.gear), self.limits.gear) {
            return Some(ValidationReason::GearRange);
        }
        None
    }

    fn delta_violation(&self, prev: Option<&Controls>, next: &Controls) -> Option<ValidationReason> {
        let prev = prev?;
        if exceeds_delta(prev.throttle, next.throttle, self.limits.throttle.delta_max) {
            return Some(ValidationReason::ThrottleDelta);
        }
        if exceeds_delta(prev.brake, next.brake, self.limits.brake.delta_max) {
            return Some(ValidationReason::BrakeDelta);
        }
        if exceeds_delta(prev.steer, next.steer, self.limits.steer.delta_max) {
            return Some(ValidationReason::SteerDelta);
        }
        let gear_delta = (prev.gear - next.gear).unsigned_abs() as f64;
        if gear_delta > self.limits.gear.delta_max + DELTA_TOLERANCE {
            return Some(ValidationReason::GearDelta);
        }
        None
    }

    fn record_burst(entry: &mut ClientState, now: u64, window: Duration) {
        let window_ms = window.as_millis() as u64;
        if entry.invalid_count == 0 || now.saturating_sub(entry.first_invalid_ms) > window_ms {
            entry.first_invalid_ms = now;
            entry.invalid_count = 1;
        } else {
            entry.invalid_count += 1;
        }
    }
}

fn in_range(value: f64, limits: ChannelLimits) -> bool {
    value >= limits.min && value <= limits.max
}

fn exceeds_delta(prev: f64, next: f64, delta_max: f64) -> bool {
    (next - prev).abs() > delta_max + DELTA_TOLERANCE
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
