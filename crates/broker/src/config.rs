// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::intent::{ChannelLimits, ValidatorLimits};

/// Authoritative real-time broker for the vehicle-combat simulation.
#[derive(Debug, Parser)]
#[command(name = "vxbroker", version, about)]
pub struct Config {
    /// HTTP/WebSocket port to listen on.
    #[arg(long, env = "VXBROKER_PORT", default_value = "8080")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "VXBROKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// gRPC port to listen on.
    #[arg(long, env = "VXBROKER_GRPC_PORT", default_value = "8081")]
    pub grpc_port: u16,

    /// Health-check-only HTTP port (serves `/healthz`, `/readyz`; route
    /// registration for these is an external collaborator, but the listen
    /// port itself is owned by this config).
    #[arg(long, env = "VXBROKER_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// TLS certificate path. Loading/termination is out of scope for the
    /// broker core; accepted here so a reverse-proxy deployment still has
    /// one place to configure it.
    #[arg(long, env = "VXBROKER_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key path (see `tls_cert`).
    #[arg(long, env = "VXBROKER_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Comma-separated list of allowed `scheme://host` origins for the
    /// WebSocket handshake. Localhost variants are always allowed in
    /// addition to this list.
    #[arg(long, env = "VXBROKER_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Maximum inbound WebSocket frame size, in bytes.
    #[arg(long, env = "VXBROKER_MAX_PAYLOAD_BYTES", default_value = "65536")]
    pub max_payload_bytes: usize,

    /// Maximum number of simultaneously connected clients. 0 = unlimited.
    #[arg(long, env = "VXBROKER_MAX_CLIENTS", default_value = "0")]
    pub max_clients: usize,

    /// Interval between keepalive pings, in milliseconds.
    #[arg(long, env = "VXBROKER_PING_INTERVAL_MS", default_value = "15000")]
    pub ping_interval_ms: u64,

    /// Multiplier applied to `ping_interval_ms` to compute the read deadline.
    #[arg(long, env = "VXBROKER_PONG_MULTIPLIER", default_value = "3")]
    pub pong_multiplier: u32,

    /// Deadline for a single write, in milliseconds.
    #[arg(long, env = "VXBROKER_WRITE_WAIT_MS", default_value = "5000")]
    pub write_wait_ms: u64,

    /// Per-client bounded send-queue capacity (slots).
    #[arg(long, env = "VXBROKER_SEND_QUEUE_CAPACITY", default_value = "256")]
    pub send_queue_capacity: usize,

    /// Path to the snapshot file.
    #[arg(long, env = "VXBROKER_SNAPSHOT_PATH", default_value = "snapshot.json")]
    pub snapshot_path: PathBuf,

    /// Minimum interval between periodic snapshot flushes, in milliseconds.
    #[arg(long, env = "VXBROKER_SNAPSHOT_INTERVAL_MS", default_value = "5000")]
    pub snapshot_interval_ms: u64,

    /// Shared HMAC secret for `/ws` bearer/query token auth. Unset disables
    /// token auth entirely (origin checking still applies).
    #[arg(long, env = "VXBROKER_HMAC_SECRET", hide_env_values = true)]
    pub hmac_secret: Option<String>,

    /// Shared secret for gRPC metadata auth (`authorization: Bearer <s>` or
    /// `x-broker-shared-secret`). Unset disables gRPC shared-secret auth.
    #[arg(long, env = "VXBROKER_GRPC_SHARED_SECRET", hide_env_values = true)]
    pub grpc_shared_secret: Option<String>,

    /// Path to a CA bundle used to verify gRPC client certificates (mTLS).
    /// Mutually exclusive with `grpc_shared_secret` as the *mechanism*, but
    /// both may be configured; whichever succeeds first admits the call.
    #[arg(long, env = "VXBROKER_GRPC_CLIENT_CA")]
    pub grpc_client_ca: Option<PathBuf>,

    /// Admin token for out-of-band operational endpoints (external
    /// collaborator; accepted here for completeness only).
    #[arg(long, env = "VXBROKER_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Simulation tick rate, in Hz.
    #[arg(long, env = "VXBROKER_TICK_HZ", default_value = "60")]
    pub tick_hz: u32,

    /// Minimum interval between accepted intents for a single controller, in
    /// milliseconds. 0 disables the gate's rate limiting rule.
    #[arg(long, env = "VXBROKER_INTENT_MIN_INTERVAL_MS", default_value = "0")]
    pub intent_min_interval_ms: u64,

    /// Maximum age of an intent's `sent_at_ms`, in milliseconds, before it is
    /// rejected as stale. 0 disables the gate's freshness rule.
    #[arg(long, env = "VXBROKER_INTENT_MAX_AGE_MS", default_value = "2000")]
    pub intent_max_age_ms: u64,

    /// Per-client outbound bandwidth budget, in bytes, for the token bucket.
    #[arg(long, env = "VXBROKER_BANDWIDTH_BUDGET_BYTES", default_value = "262144")]
    pub bandwidth_budget_bytes: u64,

    /// Per-client token bucket refill rate, in bytes/second.
    #[arg(long, env = "VXBROKER_BANDWIDTH_REFILL_BPS", default_value = "131072")]
    pub bandwidth_refill_bps: u64,

    /// Window within which repeated invalid intents count toward one burst,
    /// in milliseconds (§4.2 defaults, all overridable).
    #[arg(long, env = "VXBROKER_INTENT_BURST_WINDOW_MS", default_value = "1000")]
    pub intent_burst_window_ms: u64,

    /// Number of invalid intents within `intent_burst_window_ms` that arms a
    /// cooldown.
    #[arg(long, env = "VXBROKER_INTENT_BURST_LIMIT", default_value = "5")]
    pub intent_burst_limit: u32,

    /// Cooldown duration armed once a burst limit is reached, in
    /// milliseconds.
    #[arg(long, env = "VXBROKER_INTENT_COOLDOWN_MS", default_value = "500")]
    pub intent_cooldown_ms: u64,

    /// Number of completed cooldowns for a single `clientID|controllerID`
    /// that produces a `Disconnect=true` decision.
    #[arg(long, env = "VXBROKER_INTENT_MAX_COOLDOWN_STRIKES", default_value = "3")]
    pub intent_max_cooldown_strikes: u32,

    /// Maximum allowed per-frame delta for `throttle`.
    #[arg(long, env = "VXBROKER_INTENT_THROTTLE_DELTA_MAX", default_value = "0.35")]
    pub intent_throttle_delta_max: f64,

    /// Maximum allowed per-frame delta for `brake`.
    #[arg(long, env = "VXBROKER_INTENT_BRAKE_DELTA_MAX", default_value = "0.50")]
    pub intent_brake_delta_max: f64,

    /// Maximum allowed per-frame delta for `steer`.
    #[arg(long, env = "VXBROKER_INTENT_STEER_DELTA_MAX", default_value = "0.45")]
    pub intent_steer_delta_max: f64,

    /// Maximum allowed per-frame delta for `gear` (integer channel).
    #[arg(long, env = "VXBROKER_INTENT_GEAR_DELTA_MAX", default_value = "1.0")]
    pub intent_gear_delta_max: f64,

    /// Replay-dump rate limit window, in milliseconds (external collaborator
    /// for the `/replay/dump` diagnostic route; accepted for completeness).
    #[arg(long, env = "VXBROKER_REPLAY_DUMP_WINDOW_MS", default_value = "60000")]
    pub replay_dump_window_ms: u64,

    /// Replay-dump rate limit burst size (see `replay_dump_window_ms`).
    #[arg(long, env = "VXBROKER_REPLAY_DUMP_BURST", default_value = "5")]
    pub replay_dump_burst: u32,

    /// Log format (json or text).
    #[arg(long, env = "VXBROKER_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "VXBROKER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval_ms == 0 {
            anyhow::bail!("--ping-interval-ms must be greater than zero");
        }
        if self.pong_multiplier == 0 {
            anyhow::bail!("--pong-multiplier must be greater than zero");
        }
        if self.tick_hz == 0 {
            anyhow::bail!("--tick-hz must be greater than zero");
        }
        if self.send_queue_capacity < 256 {
            anyhow::bail!("--send-queue-capacity must be at least 256");
        }
        if self.max_payload_bytes == 0 {
            anyhow::bail!("--max-payload-bytes must be greater than zero");
        }
        if self.intent_burst_limit == 0 {
            anyhow::bail!("--intent-burst-limit must be greater than zero");
        }
        if self.intent_max_cooldown_strikes == 0 {
            anyhow::bail!("--intent-max-cooldown-strikes must be greater than zero");
        }
        if self.grpc_client_ca.is_some() && self.grpc_shared_secret.is_none() {
            // Allowed: mTLS-only is a valid configuration, but flag the
            // common typo of pointing at a CA file that doesn't exist yet.
            if !self
                .grpc_client_ca
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false)
            {
                anyhow::bail!("--grpc-client-ca path does not exist");
            }
        }
        Ok(())
    }

    /// Read deadline derived from the ping interval and pong multiplier.
    pub fn read_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval_ms * u64::from(self.pong_multiplier))
    }

    /// Interval between keepalive pings.
    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval_ms)
    }

    /// Per-write deadline.
    pub fn write_wait(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.write_wait_ms)
    }

    /// Simulation tick period.
    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.tick_hz))
    }

    /// IntentGate minimum inter-frame interval.
    pub fn intent_min_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.intent_min_interval_ms)
    }

    /// IntentGate maximum `sent_at_ms` age.
    pub fn intent_max_age(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.intent_max_age_ms)
    }

    /// Assemble [`ValidatorLimits`] from the configured burst/cooldown/delta
    /// knobs. Channel ranges themselves follow §4.2's fixed defaults
    /// (throttle/steer ∈ [-1,1], brake ∈ [0,1], gear ∈ [-1,9]) — only the
    /// per-frame delta ceilings and the burst/cooldown/strike thresholds are
    /// exposed as config, since those are the anti-cheat tuning knobs
    /// operators actually adjust; the physical control ranges are not.
    pub fn validator_limits(&self) -> ValidatorLimits {
        ValidatorLimits {
            throttle: ChannelLimits { min: -1.0, max: 1.0, delta_max: self.intent_throttle_delta_max },
            brake: ChannelLimits { min: 0.0, max: 1.0, delta_max: self.intent_brake_delta_max },
            steer: ChannelLimits { min: -1.0, max: 1.0, delta_max: self.intent_steer_delta_max },
            gear: ChannelLimits { min: -1.0, max: 9.0, delta_max: self.intent_gear_delta_max },
            invalid_burst_window: std::time::Duration::from_millis(self.intent_burst_window_ms),
            invalid_burst_limit: self.intent_burst_limit,
            cooldown_duration: std::time::Duration::from_millis(self.intent_cooldown_ms),
            max_cooldown_strikes: self.intent_max_cooldown_strikes,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
