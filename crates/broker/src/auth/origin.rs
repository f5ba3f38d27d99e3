// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Origin` header admission (§4.1 step 4, §8 invariant 9).

/// Checks a WebSocket handshake's `Origin` header against a configured
/// allowlist of `scheme://host` pairs. Localhost variants are always
/// admitted regardless of the allowlist, matching the common case of a
/// local viewer/dev client.
pub struct OriginChecker {
    allowed: Vec<(String, String)>,
}

const LOCALHOST_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "::1"];

impl OriginChecker {
    /// Build a checker from a list of `scheme://host[:port]` origins.
    /// Malformed entries are ignored (never admitted, never panic).
    pub fn new(allowed_origins: &[String]) -> Self {
        let allowed = allowed_origins
            .iter()
            .filter_map(|origin| split_scheme_host(origin))
            .map(|(scheme, host)| (scheme.to_lowercase(), host.to_lowercase()))
            .collect();
        Self { allowed }
    }

    /// Returns `true` if `origin_header` (the raw `Origin:` header value)
    /// should be admitted. `None` (header absent) is always rejected.
    pub fn is_allowed(&self, origin_header: Option<&str>) -> bool {
        let Some(raw) = origin_header else {
            return false;
        };
        let Some((scheme, host)) = split_scheme_host(raw) else {
            return false;
        };
        let host_only = strip_port(host);
        let host_only = host_only.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host_only);
        if LOCALHOST_HOSTS.contains(&host_only) {
            return true;
        }
        let scheme = scheme.to_lowercase();
        let host = host.to_lowercase();
        self.allowed.iter().any(|(s, h)| *s == scheme && *h == host)
    }
}

/// Splits `scheme://host[:port][/path]` into `(scheme, host[:port])`.
fn split_scheme_host(value: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = value.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if host.is_empty() {
        return None;
    }
    Some((scheme, host))
}

/// Strips a trailing `:port` from `host[:port]`, bracket-aware so an IPv6
/// literal like `[::1]` (no port) isn't mistaken for `host:port` at one of
/// its internal colons.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(idx) => &host[..=idx],
            None => host,
        };
    }
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

#[cfg(test)]
#[path = "origin_tests.rs"]
mod tests;
