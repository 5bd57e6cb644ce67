// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error taxonomy for the bridge.

use std::time::Duration;

use crate::child::SessionState;
use crate::protocol::{INTERNAL_ERROR, ResponseError};

/// The child closed its output stream.
pub const STREAM_ENDED: i64 = -32000;
/// No response arrived within the request timeout.
pub const REQUEST_TIMEOUT: i64 = -32001;
/// The session has not completed its handshake, or has failed.
pub const NOT_READY: i64 = -32002;

/// Errors raised by the transport, correlator, handshake and gateway.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The child process could not be launched.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// The program that was executed.
        program: String,
        /// The OS error.
        #[source]
        source: std::io::Error,
    },

    /// One inbound line was not a JSON-RPC message.
    #[error("malformed line from child: {source}")]
    Decode {
        /// The offending line, lossily decoded.
        line: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The child answered a request with a JSON-RPC error object.
    #[error("`{method}` failed: {error}")]
    Protocol {
        /// The method of the failed request.
        method: String,
        /// The child's error payload, verbatim.
        error: ResponseError,
    },

    /// The child answered `tools/call` with a JSON-RPC error object.
    #[error("tool `{name}` failed: {error}")]
    ToolCall {
        /// The tool that was called.
        name: String,
        /// The child's error payload, verbatim.
        error: ResponseError,
    },

    /// No response arrived in time. The session continues.
    #[error("`{method}` timed out after {timeout:?}")]
    Timeout {
        /// The method of the abandoned request.
        method: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// A tool operation was attempted outside the `Ready` state.
    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),

    /// The child closed its stdout.
    #[error("child closed its output stream")]
    StreamEnded,

    /// Writing to the child's stdin failed.
    #[error("failed to write to child: {0}")]
    Write(#[source] std::io::Error),

    /// The initialize exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] Box<BridgeError>),

    /// A response arrived but its result had the wrong shape.
    #[error("invalid response to `{method}`: {reason}")]
    InvalidResponse {
        /// The method of the request.
        method: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl BridgeError {
    /// Returns true if the error leaves the session unusable.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::StreamEnded | Self::Handshake(_) | Self::Write(_)
        )
    }

    /// Converts the error into the structured payload sent upstream.
    ///
    /// Errors raised by the child keep its code, message and data.
    #[must_use]
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            Self::Protocol { error, .. } | Self::ToolCall { error, .. } => error.clone(),
            Self::StreamEnded => ResponseError::new(STREAM_ENDED, self.to_string()),
            Self::Timeout { .. } => ResponseError::new(REQUEST_TIMEOUT, self.to_string()),
            Self::NotReady(_) => ResponseError::new(NOT_READY, self.to_string()),
            Self::Handshake(inner) if inner.is_session_fatal() => inner.to_response_error(),
            _ => ResponseError::new(INTERNAL_ERROR, self.to_string()),
        }
    }
}
