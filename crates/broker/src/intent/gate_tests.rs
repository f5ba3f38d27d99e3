// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::{Frame, GateReason, IntentGate};
use crate::clock::TestClock;

fn frame(sequence_id: u64, sent_at_ms: Option<u64>) -> Frame {
    Frame { sequence_id, sent_at_ms }
}

#[test]
fn accepts_strictly_increasing_sequence() {
    let clock = Arc::new(TestClock::new(0));
    let gate = IntentGate::new(Duration::ZERO, Duration::ZERO, clock);
    assert!(gate.evaluate("P1", frame(1, None)).accepted);
    assert!(gate.evaluate("P1", frame(2, None)).accepted);
}

#[test]
fn s1_regression_is_rejected_without_mutating_state() {
    let clock = Arc::new(TestClock::new(0));
    let gate = IntentGate::new(Duration::ZERO, Duration::ZERO, clock);
    assert!(gate.evaluate("P1", frame(2, None)).accepted);

    let regressed = gate.evaluate("P1", frame(1, None));
    assert!(!regressed.accepted);
    assert_eq!(regressed.reason, Some(GateReason::Regression));

    // Equal sequence also regresses.
    let equal = gate.evaluate("P1", frame(2, None));
    assert!(!equal.accepted);
    assert_eq!(equal.reason, Some(GateReason::Regression));
}

#[test]
fn rate_limited_when_below_min_interval() {
    let clock = Arc::new(TestClock::new(0));
    let min_interval = Duration::from_millis(100);
    let gate = IntentGate::new(min_interval, Duration::ZERO, clock.clone());
    assert!(gate.evaluate("P1", frame(1, None)).accepted);

    clock.advance(Duration::from_millis(50));
    let decision = gate.evaluate("P1", frame(2, None));
    assert!(!decision.accepted);
    assert_eq!(decision.reason, Some(GateReason::RateLimited));
    assert_eq!(decision.delay, Some(Duration::from_millis(50)));

    clock.advance(Duration::from_millis(50));
    assert!(gate.evaluate("P1", frame(2, None)).accepted);
}

#[test]
fn stale_when_sent_at_exceeds_max_age() {
    let clock = Arc::new(TestClock::new(1_000));
    let gate = IntentGate::new(Duration::ZERO, Duration::from_millis(100), clock.clone());
    let decision = gate.evaluate("P1", frame(1, Some(800)));
    assert!(!decision.accepted);
    assert_eq!(decision.reason, Some(GateReason::Stale));
}

#[test]
fn sent_at_within_max_age_is_accepted() {
    let clock = Arc::new(TestClock::new(1_000));
    let gate = IntentGate::new(Duration::ZERO, Duration::from_millis(500), clock);
    assert!(gate.evaluate("P1", frame(1, Some(600))).accepted);
}

#[test]
fn forget_resets_sequence_tracking() {
    let clock = Arc::new(TestClock::new(0));
    let gate = IntentGate::new(Duration::ZERO, Duration::ZERO, clock);
    assert!(gate.evaluate("P1", frame(5, None)).accepted);
    gate.forget("P1");
    // After forget, an old sequence is accepted again since tracking restarted.
    assert!(gate.evaluate("P1", frame(1, None)).accepted);
}

mod monotonic_sequence {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// For any sequence of `sequence_id`s replayed in order, a frame is
        /// accepted iff its id is strictly greater than every id accepted so
        /// far, and the gate's notion of "last accepted" only ever advances.
        #[test]
        fn accept_iff_strictly_greater_than_running_max(ids in prop::collection::vec(0u64..20, 1..40)) {
            let clock = Arc::new(TestClock::new(0));
            let gate = IntentGate::new(Duration::ZERO, Duration::ZERO, clock);
            let mut running_max: Option<u64> = None;

            for id in ids {
                let expected_accept = match running_max {
                    Some(max) => id > max,
                    None => true,
                };
                let decision = gate.evaluate("P1", frame(id, None));
                prop_assert_eq!(decision.accepted, expected_accept);
                if !expected_accept {
                    prop_assert_eq!(decision.reason, Some(GateReason::Regression));
                }
                if expected_accept {
                    running_max = Some(id);
                }
            }
        }
    }
}
