// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across HTTP, WebSocket, and gRPC transports.
///
/// Validation/cooldown/sequence/freshness rejections are not represented
/// here — those never close the connection or surface an error response;
/// they are dropped frames with a counter increment (see `intent` module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Admission rejected: auth token missing/invalid/expired.
    Unauthorized,
    /// Admission rejected: `Origin` header missing or not allowlisted.
    ForbiddenOrigin,
    /// Admission rejected: `max_clients` reached.
    Capacity,
    /// Admission rejected: broker has not finished snapshot recovery.
    Recovering,
    /// Protocol violation that does not warrant a connection close.
    BadRequest,
    /// Anything else (snapshot write failure, internal invariant breach).
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::ForbiddenOrigin => 403,
            Self::Capacity | Self::Recovering => 503,
            Self::BadRequest => 400,
            Self::Internal => 500,
        }
    }

    pub fn grpc_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHENTICATED",
            Self::ForbiddenOrigin => "PERMISSION_DENIED",
            Self::Capacity | Self::Recovering => "UNAVAILABLE",
            Self::BadRequest => "INVALID_ARGUMENT",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ForbiddenOrigin => "FORBIDDEN_ORIGIN",
            Self::Capacity => "CAPACITY",
            Self::Recovering => "RECOVERING",
            Self::BadRequest => "BAD_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }

    /// Convert this error code into a [`tonic::Status`] with the given message.
    pub fn to_grpc_status(&self, message: impl Into<String>) -> tonic::Status {
        let code = match self {
            Self::Unauthorized => tonic::Code::Unauthenticated,
            Self::ForbiddenOrigin => tonic::Code::PermissionDenied,
            Self::Capacity | Self::Recovering => tonic::Code::Unavailable,
            Self::BadRequest => tonic::Code::InvalidArgument,
            Self::Internal => tonic::Code::Internal,
        };
        tonic::Status::new(code, message)
    }

    /// The JSON admission-failure body required by §6/§7: `{status, message}`.
    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { status: self.as_str().to_owned(), message: message.into() }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body for admission failures (401/403/503).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

/// WebSocket close codes used by the connection manager (§6).
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (client-initiated or server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Frame exceeded `max_payload_bytes`.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Unexpected server-side error.
    pub const SERVER_ERROR: u16 = 1011;
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
