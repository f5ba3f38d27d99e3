// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client token-bucket admission for outbound bytes (§4.5 bandwidth
//! regulation).
//!
//! `Allow` is consulted before every write to a client's send queue. A
//! denial drops that one frame for that one client and increments a
//! counter — it never closes the connection (§7: the slow-consumer policy
//! is a separate, later-engaged mechanism).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::clock::SharedClock;

struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Per-client token bucket for outbound bandwidth (§4.5, §5).
pub struct BandwidthRegulator {
    budget_bytes: f64,
    refill_bps: f64,
    clock: SharedClock,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl BandwidthRegulator {
    /// `budget_bytes` is both the bucket capacity and its starting balance;
    /// `refill_bps` is the steady-state refill rate in bytes/second.
    pub fn new(budget_bytes: u64, refill_bps: u64, clock: SharedClock) -> Self {
        Self {
            budget_bytes: budget_bytes as f64,
            refill_bps: refill_bps as f64,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `bytes` may be written to `client_id`'s send queue
    /// right now, consuming that many tokens on success. A denial does not
    /// consume tokens and leaves the bucket for the next attempt.
    pub fn allow(&self, client_id: &str, bytes: usize) -> bool {
        let now = self.clock.now_ms();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets
            .entry(client_id.to_owned())
            .or_insert_with(|| Bucket { tokens: self.budget_bytes, last_refill_ms: now });

        let elapsed_ms = now.saturating_sub(bucket.last_refill_ms) as f64;
        if elapsed_ms > 0.0 {
            let refill = elapsed_ms / 1000.0 * self.refill_bps;
            bucket.tokens = (bucket.tokens + refill).min(self.budget_bytes);
            bucket.last_refill_ms = now;
        }

        if bucket.tokens >= bytes as f64 {
            bucket.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Drop all bucket state for `client_id`, called on disconnect.
    pub fn forget(&self, client_id: &str) {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.remove(client_id);
    }
}

#[cfg(test)]
#[path = "bandwidth_tests.rs"]
mod tests;
