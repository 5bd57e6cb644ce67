// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The MCP initialize exchange.

use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::correlator::Correlator;
use super::state::{SessionState, StateTracker};
use crate::config::DEFAULT_PROTOCOL_VERSION;
use crate::error::BridgeError;
use crate::mcp::InitializeResult;

/// What we say about ourselves in `initialize`.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Protocol revision requested.
    pub protocol_version: String,
    /// `clientInfo.name`.
    pub client_name: String,
    /// `clientInfo.version`.
    pub client_version: String,
    /// Client capabilities advertised to the child.
    pub capabilities: Value,
    /// Bound on the initialize request and the `initialized` notification.
    pub timeout: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            client_name: "tether".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: json!({ "tools": {} }),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Runs `initialize` then `notifications/initialized`.
///
/// Moves the session to `Ready` on success and `Failed` on any error.
///
/// # Errors
///
/// Returns [`BridgeError::Handshake`] wrapping the cause.
pub async fn perform(
    correlator: &Correlator,
    state: &StateTracker,
    options: &HandshakeOptions,
) -> Result<InitializeResult, BridgeError> {
    state.set(SessionState::Handshaking);

    match exchange(correlator, options).await {
        Ok(result) => {
            state.set(SessionState::Ready);
            Ok(result)
        }
        Err(e) => {
            state.fail(&format!("handshake: {e}"));
            Err(BridgeError::Handshake(Box::new(e)))
        }
    }
}

async fn exchange(
    correlator: &Correlator,
    options: &HandshakeOptions,
) -> Result<InitializeResult, BridgeError> {
    let params = json!({
        "protocolVersion": options.protocol_version,
        "capabilities": options.capabilities,
        "clientInfo": {
            "name": options.client_name,
            "version": options.client_version,
        },
    });

    let value = correlator
        .call("initialize", Some(params), options.timeout)
        .await?;

    if !value.is_object() {
        return Err(BridgeError::InvalidResponse {
            method: "initialize".to_string(),
            reason: format!("expected an object, got {value}"),
        });
    }

    let result: InitializeResult =
        serde_json::from_value(value).map_err(|e| BridgeError::InvalidResponse {
            method: "initialize".to_string(),
            reason: e.to_string(),
        })?;

    if result.protocol_version != options.protocol_version {
        debug!(
            "Child negotiated protocol {:?} (requested {})",
            result.protocol_version, options.protocol_version
        );
    }

    tokio::time::timeout(
        options.timeout,
        correlator.notify("notifications/initialized", None),
    )
    .await
    .map_err(|_| BridgeError::Timeout {
        method: "notifications/initialized".to_string(),
        timeout: options.timeout,
    })??;

    match &result.server_info {
        Some(info) => info!(
            "Connected to {} {}",
            info.name,
            info.version.as_deref().unwrap_or("")
        ),
        None => info!("Connected to unnamed MCP server"),
    }

    Ok(result)
}
