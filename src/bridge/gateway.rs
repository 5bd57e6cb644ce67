// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tool-level facade over one child session.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::child::{
    Correlator, HandshakeOptions, Inbound, LineReader, SessionState, StateTracker, Transport,
    handshake,
};
use crate::config::{ChildConfig, Config};
use crate::error::BridgeError;
use crate::mcp::{InitializeResult, ToolDescriptor, ToolResult};

/// Timeouts and identity used by a [`ToolGateway`].
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Bound on each `tools/list` and `tools/call`.
    pub request_timeout: Duration,
    /// How to run `initialize`.
    pub handshake: HandshakeOptions,
    /// Grace period between closing stdin and killing the child.
    pub terminate_grace: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            handshake: HandshakeOptions::default(),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

impl GatewayOptions {
    /// Derives options from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            handshake: HandshakeOptions {
                protocol_version: config.protocol_version.clone(),
                timeout: config.handshake_timeout(),
                ..HandshakeOptions::default()
            },
            terminate_grace: config.terminate_grace(),
        }
    }
}

/// An established (or establishing) session with one child MCP server.
///
/// Owns the child exclusively. Call [`terminate`](Self::terminate) when done;
/// dropping without it still kills the process.
pub struct ToolGateway {
    transport: Arc<Transport>,
    correlator: Correlator,
    state: StateTracker,
    options: GatewayOptions,
    initialize: RwLock<Option<InitializeResult>>,
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl ToolGateway {
    /// Spawns the child. The handshake has not run yet.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] if the process cannot be started.
    pub fn spawn(child: &ChildConfig, options: GatewayOptions) -> Result<Self, BridgeError> {
        let state = StateTracker::new();
        state.set(SessionState::Starting);
        let (transport, reader) = Transport::spawn(child, options.terminate_grace)?;

        info!("Spawned child MCP server: {}", child.command);
        Ok(Self::assemble(transport, reader, state, options))
    }

    /// Spawns the child and completes the handshake.
    ///
    /// The child is terminated again if the handshake fails.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] or [`BridgeError::Handshake`].
    pub async fn connect(child: &ChildConfig, options: GatewayOptions) -> Result<Self, BridgeError> {
        let gateway = Self::spawn(child, options)?;
        if let Err(e) = gateway.handshake().await {
            gateway.terminate().await;
            return Err(e);
        }
        Ok(gateway)
    }

    /// Runs a session over arbitrary byte streams instead of a process.
    pub fn attach<R, W>(reader: R, writer: W, options: GatewayOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = StateTracker::new();
        state.set(SessionState::Starting);
        let (transport, reader) = Transport::attach(reader, writer);
        let transport = transport.with_grace(options.terminate_grace);
        Self::assemble(transport, reader, state, options)
    }

    fn assemble(
        transport: Transport,
        reader: LineReader,
        state: StateTracker,
        options: GatewayOptions,
    ) -> Self {
        let transport = Arc::new(transport);
        let correlator = Correlator::start(transport.clone(), reader, state.clone());
        Self {
            transport,
            correlator,
            state,
            options,
            initialize: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Performs the initialize exchange. Returns the stored result if the
    /// session is already `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Handshake`] on failure, or
    /// [`BridgeError::NotReady`] if the session is past the point where a
    /// handshake can run.
    pub async fn handshake(&self) -> Result<InitializeResult, BridgeError> {
        match self.state.get() {
            SessionState::Starting => {}
            SessionState::Ready => {
                if let Some(result) = self.initialize.read().await.clone() {
                    return Ok(result);
                }
            }
            other => return Err(BridgeError::NotReady(other)),
        }

        let result = handshake::perform(&self.correlator, &self.state, &self.options.handshake).await?;
        *self.initialize.write().await = Some(result.clone());
        Ok(result)
    }

    /// Fetches the child's tool catalog with one `tools/list` request.
    ///
    /// A successful listing replaces [`cached_tools`](Self::cached_tools).
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotReady`] before the handshake or after failure.
    /// - [`BridgeError::Protocol`] if the child answered with an error.
    /// - [`BridgeError::InvalidResponse`] if `tools` is not an array.
    /// - [`BridgeError::Timeout`] or [`BridgeError::StreamEnded`].
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        self.state.require_ready()?;

        let result = self
            .correlator
            .call("tools/list", None, self.options.request_timeout)
            .await?;
        let tools = parse_tool_list(result)?;

        debug!("Child listed {} tool(s)", tools.len());
        (*self.tools.write().await).clone_from(&tools);
        Ok(tools)
    }

    /// Invokes one tool. Arguments are passed through unvalidated.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotReady`] before the handshake or after failure.
    /// - [`BridgeError::ToolCall`] carrying the child's error payload verbatim.
    /// - [`BridgeError::InvalidResponse`] if the result is not an object.
    /// - [`BridgeError::Timeout`] or [`BridgeError::StreamEnded`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, BridgeError> {
        self.state.require_ready()?;

        let params = json!({ "name": name, "arguments": arguments });
        let result = self
            .correlator
            .call("tools/call", Some(params), self.options.request_timeout)
            .await
            .map_err(|e| match e {
                BridgeError::Protocol { error, .. } => BridgeError::ToolCall {
                    name: name.to_string(),
                    error,
                },
                other => other,
            })?;

        parse_tool_result(result)
    }

    /// Tools from the last successful listing.
    pub async fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Watches session state, e.g. to restart after `Failed`.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The child's `initialize` answer, once the handshake succeeded.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.initialize.read().await.clone()
    }

    /// Child-initiated notifications and requests. `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.correlator.take_inbound()
    }

    /// Process ID of the child, if there is one.
    pub async fn pid(&self) -> Option<u32> {
        self.transport.pid().await
    }

    /// Ends the session: closes stdin, sends SIGTERM, kills after the grace
    /// period and fails every outstanding call with
    /// [`BridgeError::StreamEnded`]. Idempotent.
    pub async fn terminate(&self) {
        if self.state.get() == SessionState::Terminated {
            return;
        }
        self.state.set(SessionState::Terminating);

        self.transport.terminate().await;
        let failed = self.correlator.close();
        if failed > 0 {
            warn!("{} pending call(s) failed by shutdown", failed);
        }

        self.state.set(SessionState::Terminated);
        info!("Session terminated");
    }
}

fn parse_tool_list(result: Value) -> Result<Vec<ToolDescriptor>, BridgeError> {
    let invalid = |reason: String| BridgeError::InvalidResponse {
        method: "tools/list".to_string(),
        reason,
    };

    let entries = match result {
        Value::Object(mut map) => match map.remove("tools") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(entries)) => entries,
            Some(other) => return Err(invalid(format!("`tools` is not an array: {other}"))),
        },
        Value::Null => return Ok(Vec::new()),
        other => return Err(invalid(format!("expected an object, got {other}"))),
    };

    let mut tools = Vec::with_capacity(entries.len());
    for entry in entries {
        if !entry.get("name").is_some_and(Value::is_string) {
            warn!("Skipping tool without a name: {}", entry);
            continue;
        }
        match serde_json::from_value::<ToolDescriptor>(entry) {
            Ok(tool) => tools.push(tool),
            Err(e) => warn!("Skipping malformed tool entry: {}", e),
        }
    }
    Ok(tools)
}

fn parse_tool_result(result: Value) -> Result<ToolResult, BridgeError> {
    match result {
        Value::Null => Ok(ToolResult::default()),
        Value::Object(mut map) => {
            if map.get("content").is_some_and(Value::is_null) {
                map.remove("content");
            }
            serde_json::from_value(Value::Object(map)).map_err(|e| BridgeError::InvalidResponse {
                method: "tools/call".to_string(),
                reason: e.to_string(),
            })
        }
        other => Err(BridgeError::InvalidResponse {
            method: "tools/call".to_string(),
            reason: format!("expected an object, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::testing::{FakeChild, pipes};
    use crate::error::STREAM_ENDED;
    use crate::mcp::ToolContent;
    use anyhow::{Context, Result, bail};

    fn options() -> GatewayOptions {
        GatewayOptions {
            request_timeout: Duration::from_secs(2),
            ..GatewayOptions::default()
        }
    }

    fn attached() -> (Arc<ToolGateway>, FakeChild) {
        let (reader, writer, child) = pipes();
        (Arc::new(ToolGateway::attach(reader, writer, options())), child)
    }

    async fn ready() -> Result<(Arc<ToolGateway>, FakeChild)> {
        let (gateway, mut child) = attached();
        let (outcome, served) = tokio::join!(gateway.handshake(), child.complete_handshake());
        served?;
        outcome?;
        Ok((gateway, child))
    }

    #[tokio::test]
    async fn test_call_before_handshake_writes_nothing() -> Result<()> {
        let (gateway, mut child) = attached();

        let err = gateway.call_tool("echo", json!({})).await;
        assert!(matches!(err, Err(BridgeError::NotReady(SessionState::Starting))));
        let err = gateway.list_tools().await;
        assert!(matches!(err, Err(BridgeError::NotReady(_))));

        assert!(child.try_recv(Duration::from_millis(100)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_tools_round_trips_descriptor() -> Result<()> {
        let (gateway, mut child) = ready().await?;
        let listed = json!([{ "name": "echo", "description": "d", "inputSchema": {} }]);

        let (tools, served) = tokio::join!(gateway.list_tools(), async {
            let request = child.recv().await?;
            child
                .respond(&request["id"], json!({ "tools": listed.clone() }))
                .await?;
            anyhow::Ok(request)
        });
        let request = served?;
        let tools = tools?;

        assert_eq!(request["method"], "tools/list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description.as_deref(), Some("d"));
        assert_eq!(serde_json::to_value(&tools)?, listed);
        assert_eq!(gateway.cached_tools().await, tools);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_tools_skips_nameless_and_defaults_schema() -> Result<()> {
        let (gateway, mut child) = ready().await?;

        let (tools, served) = tokio::join!(gateway.list_tools(), async {
            let request = child.recv().await?;
            child
                .respond(
                    &request["id"],
                    json!({ "tools": [
                        { "description": "no name" },
                        { "name": 42 },
                        { "name": "search_nodes", "annotations": { "readOnlyHint": true } }
                    ]}),
                )
                .await
        });
        served?;
        let tools = tools?;

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search_nodes");
        assert_eq!(tools[0].input_schema, json!({}));
        assert_eq!(tools[0].extra["annotations"]["readOnlyHint"], true);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_tools_missing_key_is_empty() -> Result<()> {
        let (gateway, mut child) = ready().await?;

        let (tools, served) = tokio::join!(gateway.list_tools(), async {
            let request = child.recv().await?;
            child.respond(&request["id"], json!({})).await
        });
        served?;
        assert!(tools?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_call_tool_text_content() -> Result<()> {
        let (gateway, mut child) = ready().await?;

        let (result, served) = tokio::join!(gateway.call_tool("echo", json!({})), async {
            let request = child.recv().await?;
            child
                .respond(
                    &request["id"],
                    json!({ "content": [{ "type": "text", "text": "hi" }] }),
                )
                .await?;
            anyhow::Ok(request)
        });
        let request = served?;
        let result = result?;

        assert_eq!(request["method"], "tools/call");
        assert_eq!(request["params"], json!({ "name": "echo", "arguments": {} }));
        assert_eq!(result.content, vec![ToolContent::Text("hi".to_string())]);
        assert!(!result.is_error);
        assert_eq!(result.text(), "hi");
        Ok(())
    }

    #[tokio::test]
    async fn test_call_tool_keeps_opaque_content_and_is_error() -> Result<()> {
        let (gateway, mut child) = ready().await?;
        let image = json!({ "type": "image", "data": "aGk=", "mimeType": "image/png" });

        let (result, served) = tokio::join!(gateway.call_tool("shot", json!(null)), async {
            let request = child.recv().await?;
            child
                .respond(
                    &request["id"],
                    json!({ "content": [image.clone()], "isError": true }),
                )
                .await
        });
        served?;
        let result = result?;

        assert!(result.is_error);
        assert_eq!(result.content, vec![ToolContent::Opaque(image.clone())]);
        assert_eq!(serde_json::to_value(&result)?["content"][0], image);
        Ok(())
    }

    #[tokio::test]
    async fn test_call_tool_empty_content() -> Result<()> {
        let (gateway, mut child) = ready().await?;

        let (result, served) = tokio::join!(gateway.call_tool("noop", json!({})), async {
            let request = child.recv().await?;
            child.respond(&request["id"], json!({ "content": null })).await
        });
        served?;
        assert_eq!(result?, ToolResult::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_error_payload_is_verbatim() -> Result<()> {
        let (gateway, mut child) = ready().await?;

        let (result, served) = tokio::join!(gateway.call_tool("nope", json!({})), async {
            let request = child.recv().await?;
            child
                .send(&json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": { "code": -32602, "message": "Unknown tool: nope", "data": { "tool": "nope" } }
                }))
                .await
        });
        served?;

        match result {
            Err(BridgeError::ToolCall { name, error }) => {
                assert_eq!(name, "nope");
                assert_eq!(error.code, -32602);
                assert_eq!(error.message, "Unknown tool: nope");
                assert_eq!(error.data, Some(json!({ "tool": "nope" })));
            }
            other => bail!("expected tool call error, got {other:?}"),
        }
        assert_eq!(gateway.state(), SessionState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn test_child_exit_fails_call_then_not_ready() -> Result<()> {
        let (gateway, mut child) = ready().await?;

        let call = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.call_tool("slow", json!({})).await })
        };
        child.recv().await?;
        drop(child);

        let err = call.await?.err().context("call should fail")?;
        assert!(matches!(err, BridgeError::StreamEnded));
        assert_eq!(err.to_response_error().code, STREAM_ENDED);

        assert!(matches!(
            gateway.list_tools().await,
            Err(BridgeError::NotReady(SessionState::Failed))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_resolves_pending_calls() -> Result<()> {
        let (gateway, mut child) = ready().await?;
        let mut states = gateway.subscribe_state();

        let call = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.call_tool("slow", json!({})).await })
        };
        child.recv().await?;

        gateway.terminate().await;
        assert!(matches!(call.await?, Err(BridgeError::StreamEnded)));
        assert_eq!(gateway.state(), SessionState::Terminated);
        assert_eq!(*states.borrow_and_update(), SessionState::Terminated);

        // Second terminate is a no-op.
        gateway.terminate().await;
        assert_eq!(gateway.state(), SessionState::Terminated);
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_result_is_kept() -> Result<()> {
        let (gateway, _child) = ready().await?;
        let info = gateway.server_info().await.context("no server info")?;
        assert_eq!(info.server_info.map(|s| s.name).as_deref(), Some("fake"));

        // A second handshake returns the stored answer without traffic.
        let again = gateway.handshake().await?;
        assert_eq!(again.protocol_version, "2024-11-05");
        Ok(())
    }

    #[test]
    fn test_tools_not_an_array_is_invalid() {
        assert!(matches!(
            parse_tool_list(json!({ "tools": "echo" })),
            Err(BridgeError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_tool_result(json!([1, 2])),
            Err(BridgeError::InvalidResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_child_that_stops_reading_cannot_wedge_the_session() -> Result<()> {
        let (reader, writer, mut child) = pipes();
        let options = GatewayOptions {
            request_timeout: Duration::from_millis(200),
            terminate_grace: Duration::from_millis(200),
            ..GatewayOptions::default()
        };
        let gateway = ToolGateway::attach(reader, writer, options);
        let (outcome, served) = tokio::join!(gateway.handshake(), child.complete_handshake());
        served?;
        outcome?;

        // From here on the child never reads, and the request overflows the pipe.
        let blob = "x".repeat(256 * 1024);
        let call = tokio::time::timeout(
            Duration::from_secs(2),
            gateway.call_tool("echo", json!({ "blob": blob })),
        )
        .await
        .context("call_tool outlived its request timeout")?;
        assert!(matches!(call, Err(BridgeError::Timeout { .. })));
        assert_eq!(gateway.state(), SessionState::Failed);

        tokio::time::timeout(Duration::from_secs(2), gateway.terminate())
            .await
            .context("terminate outlived its grace period")?;
        assert_eq!(gateway.state(), SessionState::Terminated);
        drop(child);
        Ok(())
    }
}
