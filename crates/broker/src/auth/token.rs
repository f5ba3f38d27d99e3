// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HMAC-SHA256 compact token verification (§6 Auth, §4.1 step 5, §8
//! invariant 10).
//!
//! The token is `header.payload.signature`, each segment base64url
//! (no padding). Header is always `{"alg":"HS256","typ":"JWT"}`; payload
//! must contain `sub`, `exp`, `iat` (seconds since the epoch). The server
//! allows ±2 seconds of clock skew on `exp`.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Bounded clock skew tolerated on token expiry, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 2;

#[derive(Debug, Deserialize)]
struct Header<'a> {
    alg: &'a str,
    #[serde(default)]
    typ: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    #[allow(dead_code)]
    iat: i64,
}

/// The subject extracted from a successfully verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub sub: String,
}

/// Why a token was rejected. Callers map every variant to §4.1's `401`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    UnsupportedAlgorithm,
    BadSignature,
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Malformed => "malformed token",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::BadSignature => "bad signature",
            Self::Expired => "token expired",
        };
        f.write_str(msg)
    }
}

/// Verifies HMAC-SHA256 compact tokens against a single shared secret.
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Verify `token` against the current time `now_ms` (milliseconds since
    /// the epoch). On success, returns the token's `sub` claim, which
    /// becomes the client's ID (§4.1 step 5).
    pub fn verify(&self, token: &str, now_ms: u64) -> Result<VerifiedToken, TokenError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => return Err(TokenError::Malformed),
            };

        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let header_bytes = engine.decode(header_b64).map_err(|_| TokenError::Malformed)?;
        let header: Header = serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
        if header.alg != "HS256" {
            return Err(TokenError::UnsupportedAlgorithm);
        }
        if let Some(typ) = header.typ {
            if !typ.eq_ignore_ascii_case("JWT") {
                return Err(TokenError::Malformed);
            }
        }

        let payload_bytes = engine.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;

        let signature = engine.decode(sig_b64).map_err(|_| TokenError::Malformed)?;

        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Malformed)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

        let now_secs = (now_ms / 1000) as i64;
        if claims.exp < now_secs - CLOCK_SKEW_SECS {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedToken { sub: claims.sub })
    }
}

/// Extracts a raw bearer token from either the `auth_token` query parameter
/// or an `X-Auth-Token` header value, preferring the query parameter (the
/// WebSocket handshake cannot always set custom headers from a browser).
pub fn extract_token(query_auth_token: Option<&str>, header_auth_token: Option<&str>) -> Option<String> {
    query_auth_token
        .filter(|t| !t.is_empty())
        .or(header_auth_token.filter(|t| !t.is_empty()))
        .map(str::to_owned)
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
