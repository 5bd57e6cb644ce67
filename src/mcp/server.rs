//! MCP server implementation.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use super::types::{
    CallToolParams, InitializeParams, InitializeResult, ListToolsResult, ServerInfo,
    ToolDescriptor, ToolResult,
};
use crate::config::DEFAULT_PROTOCOL_VERSION;
use crate::protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, Message, NotificationMessage, PARSE_ERROR,
    RequestId, RequestMessage, ResponseError, ResponseMessage, encode_line,
};

/// Trait for handling MCP tool requests.
///
/// Each request runs in its own task, so implementations must be shareable.
pub trait ToolHandler: Send + Sync + 'static {
    /// Returns the list of available tools.
    fn list_tools(&self) -> impl Future<Output = Result<Vec<ToolDescriptor>, ResponseError>> + Send;

    /// Handles a tool call and returns the result.
    fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> impl Future<Output = Result<ToolResult, ResponseError>> + Send;
}

/// MCP server that communicates over newline-delimited JSON-RPC.
pub struct McpServer<H: ToolHandler> {
    handler: Arc<H>,
    info: ServerInfo,
    instructions: Option<String>,
}

type Outbox = mpsc::UnboundedSender<ResponseMessage>;

impl<H: ToolHandler> McpServer<H> {
    /// Creates a server answering `initialize` as `info`.
    pub fn new(handler: H, info: ServerInfo) -> Self {
        Self {
            handler: Arc::new(handler),
            info,
            instructions: None,
        }
    }

    /// Sets the `instructions` returned from `initialize`.
    #[must_use]
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    /// Runs the MCP server, reading from stdin and writing to stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin cannot be read.
    pub async fn run(&self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serves requests from `input` until it closes, then waits for every
    /// in-flight request to be answered.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` cannot be read.
    pub async fn serve<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbox, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_responses(output, rx));

        let mut input = BufReader::new(input);
        let mut line = Vec::new();
        let mut in_flight = JoinSet::new();
        let mut abort_handles: HashMap<RequestId, AbortHandle> = HashMap::new();

        info!("MCP server starting, waiting for requests on stdin");

        let outcome = loop {
            line.clear();
            // Raw bytes: a line that is not UTF-8 is a parse error, not the end.
            match input
                .read_until(b'\n', &mut line)
                .await
                .context("Failed to read from stdin")
            {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            trace!("Received: {}", String::from_utf8_lossy(&line).trim_end());

            match serde_json::from_slice(&line).and_then(Message::from_value) {
                Ok(Message::Request(request)) => {
                    self.handle_request(request, &outbox, &mut in_flight, &mut abort_handles);
                }
                Ok(Message::Notification(notification)) => {
                    handle_notification(&notification, &mut abort_handles);
                }
                Ok(Message::Response(response)) => {
                    debug!("Ignoring response from client (id={:?})", response.id);
                }
                Err(e) => {
                    warn!("Failed to parse message: {}", e);
                    let _ = outbox.send(ResponseMessage::failure(
                        None,
                        ResponseError::new(PARSE_ERROR, format!("Parse error: {e}")),
                    ));
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }
            abort_handles.retain(|_, handle| !handle.is_finished());
        };

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight request(s)", in_flight.len());
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }

        drop(outbox);
        if let Err(e) = writer.await {
            error!("Response writer failed: {}", e);
        }

        info!("MCP server shutting down (stdin closed)");
        outcome
    }

    fn handle_request(
        &self,
        request: RequestMessage,
        outbox: &Outbox,
        in_flight: &mut JoinSet<()>,
        abort_handles: &mut HashMap<RequestId, AbortHandle>,
    ) {
        let RequestMessage {
            id, method, params, ..
        } = request;
        debug!("Handling request: {} (id={})", method, id);

        match method.as_str() {
            "initialize" => {
                let _ = outbox.send(self.handle_initialize(id, params));
            }
            "ping" => {
                let _ = outbox.send(respond(id, Ok(json!({}))));
            }
            "tools/list" => {
                let handler = self.handler.clone();
                let outbox = outbox.clone();
                let key = id.clone();
                let handle = in_flight.spawn(async move {
                    let result = handler
                        .list_tools()
                        .await
                        .and_then(|tools| to_value(&ListToolsResult { tools }));
                    let _ = outbox.send(respond(id, result));
                });
                abort_handles.insert(key, handle);
            }
            "tools/call" => {
                let params = match parse_call_params(params) {
                    Ok(params) => params,
                    Err(e) => {
                        let _ = outbox.send(ResponseMessage::failure(Some(id), e));
                        return;
                    }
                };
                debug!("Calling tool: {}", params.name);

                let handler = self.handler.clone();
                let outbox = outbox.clone();
                let key = id.clone();
                let handle = in_flight.spawn(async move {
                    let arguments = params.arguments.unwrap_or_else(|| json!({}));
                    let result = handler
                        .call_tool(&params.name, arguments)
                        .await
                        .and_then(|result| to_value(&result));
                    if let Err(e) = &result {
                        warn!("Tool call {} failed: {}", params.name, e);
                    }
                    let _ = outbox.send(respond(id, result));
                });
                abort_handles.insert(key, handle);
            }
            _ => {
                warn!("Unknown method: {}", method);
                let _ = outbox.send(ResponseMessage::failure(
                    Some(id),
                    ResponseError::new(METHOD_NOT_FOUND, format!("Unknown method: {method}")),
                ));
            }
        }
    }

    fn handle_initialize(&self, id: RequestId, params: Option<Value>) -> ResponseMessage {
        let params: InitializeParams = params
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();

        let client = params.client_info.as_ref();
        info!(
            "MCP client connecting: {} v{}",
            client.map_or("unknown", |c| c.name.as_str()),
            client.and_then(|c| c.version.as_deref()).unwrap_or("unknown")
        );

        let protocol_version = params
            .protocol_version
            .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string());
        info!("Protocol version: {}", protocol_version);

        let result = InitializeResult {
            protocol_version,
            capabilities: json!({ "tools": {} }),
            server_info: Some(self.info.clone()),
            instructions: self.instructions.clone(),
        };

        respond(id, to_value(&result))
    }
}

fn handle_notification(
    notification: &NotificationMessage,
    abort_handles: &mut HashMap<RequestId, AbortHandle>,
) {
    debug!("Handling notification: {}", notification.method);

    match notification.method.as_str() {
        "notifications/initialized" => info!("MCP client initialized"),
        "notifications/cancelled" => {
            let request_id = notification
                .params
                .as_ref()
                .and_then(|p| p.get("requestId"))
                .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

            match request_id.and_then(|id| abort_handles.remove(&id).map(|h| (id, h))) {
                Some((id, handle)) => {
                    debug!("Cancelling request {}", id);
                    handle.abort();
                }
                None => debug!("Cancellation for a request that is not in flight"),
            }
        }
        _ => debug!("Ignoring unknown notification: {}", notification.method),
    }
}

fn parse_call_params(params: Option<Value>) -> Result<CallToolParams, ResponseError> {
    let params = params
        .ok_or_else(|| ResponseError::new(INVALID_PARAMS, "Missing tools/call params"))?;
    serde_json::from_value(params)
        .map_err(|e| ResponseError::new(INVALID_PARAMS, format!("Invalid tools/call params: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ResponseError> {
    serde_json::to_value(value)
        .map_err(|e| ResponseError::new(INTERNAL_ERROR, format!("Failed to encode result: {e}")))
}

fn respond(id: RequestId, result: Result<Value, ResponseError>) -> ResponseMessage {
    match result {
        Ok(value) => ResponseMessage::success(id.clone(), value).unwrap_or_else(|e| {
            ResponseMessage::failure(Some(id), ResponseError::new(INTERNAL_ERROR, e.to_string()))
        }),
        Err(error) => ResponseMessage::failure(Some(id), error),
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && !e.is_cancelled()
    {
        error!("Request task failed: {}", e);
    }
}

/// Single writer so response lines never interleave.
async fn write_responses<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<ResponseMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let line = match encode_line(&response) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode response: {}", e);
                continue;
            }
        };
        trace!("Sending: {}", String::from_utf8_lossy(&line).trim_end());

        if let Err(e) = output.write_all(&line).await {
            error!("Failed to write response: {}", e);
            break;
        }
        if let Err(e) = output.flush().await {
            error!("Failed to flush response: {}", e);
            break;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::mcp::ToolContent;
    use std::time::Duration;
    use tokio::io::{DuplexStream, Lines, duplex};
    use tokio::sync::Notify;

    struct TestHandler {
        release: Arc<Notify>,
    }

    impl ToolHandler for TestHandler {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ResponseError> {
            Ok(vec![ToolDescriptor {
                name: "test_tool".to_string(),
                description: Some("A test tool".to_string()),
                input_schema: json!({ "type": "object", "properties": {} }),
                extra: serde_json::Map::new(),
            }])
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ResponseError> {
            match name {
                "test_tool" => Ok(ToolResult {
                    content: vec![ToolContent::Text(format!("args: {arguments}"))],
                    ..ToolResult::default()
                }),
                "slow_tool" => {
                    self.release.notified().await;
                    Ok(ToolResult {
                        content: vec![ToolContent::Text("slow".to_string())],
                        ..ToolResult::default()
                    })
                }
                _ => Err(ResponseError::new(-32602, format!("Unknown tool: {name}"))),
            }
        }
    }

    struct Harness {
        client: DuplexStream,
        responses: Lines<BufReader<DuplexStream>>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(release: Arc<Notify>) -> Harness {
        let (client, server_in) = duplex(64 * 1024);
        let (server_out, client_in) = duplex(64 * 1024);

        let server = McpServer::new(
            TestHandler { release },
            ServerInfo {
                name: "tether".to_string(),
                version: Some("0.0.0".to_string()),
            },
        )
        .with_instructions(Some("Use search first.".to_string()));

        let server = tokio::spawn(async move { server.serve(server_in, server_out).await });
        Harness {
            client,
            responses: BufReader::new(client_in).lines(),
            server,
        }
    }

    impl Harness {
        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.client.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(2), self.responses.next_line())
                .await
                .expect("timed out waiting for a response")
                .unwrap()
                .expect("server closed its output");
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_handle_initialize() {
        let mut h = start(Arc::new(Notify::new()));
        h.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }
        }))
        .await;

        let response = h.recv().await;
        assert_eq!(response["id"], 1);
        assert!(response.get("error").is_none());
        let result: InitializeResult = serde_json::from_value(response["result"].clone()).unwrap();
        assert_eq!(result.server_info.as_ref().unwrap().name, "tether");
        assert_eq!(result.protocol_version, "2024-11-05");
        assert_eq!(result.instructions.as_deref(), Some("Use search first."));
        assert!(result.supports_tools());
    }

    #[tokio::test]
    async fn test_handle_tools_list() {
        let mut h = start(Arc::new(Notify::new()));
        h.send(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
            .await;

        let response = h.recv().await;
        let result: ListToolsResult = serde_json::from_value(response["result"].clone()).unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "test_tool");
    }

    #[tokio::test]
    async fn test_handle_tools_call_success() {
        let mut h = start(Arc::new(Notify::new()));
        h.send(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": { "name": "test_tool", "arguments": { "q": 1 } }
        }))
        .await;

        let response = h.recv().await;
        assert_eq!(response["result"]["content"][0]["text"], "args: {\"q\":1}");
        assert!(response["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn test_handle_tools_call_error() {
        let mut h = start(Arc::new(Notify::new()));
        h.send(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": { "name": "error_tool" }
        }))
        .await;

        let response = h.recv().await;
        assert_eq!(response["id"], 4);
        assert_eq!(response["error"]["code"], -32602);
        assert_eq!(response["error"]["message"], "Unknown tool: error_tool");
    }

    #[tokio::test]
    async fn test_tools_call_without_params() {
        let mut h = start(Arc::new(Notify::new()));
        h.send(json!({ "jsonrpc": "2.0", "id": "x", "method": "tools/call" }))
            .await;

        let response = h.recv().await;
        assert_eq!(response["id"], "x");
        assert_eq!(response["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_handle_unknown_method() {
        let mut h = start(Arc::new(Notify::new()));
        h.send(json!({ "jsonrpc": "2.0", "id": 5, "method": "resources/list" }))
            .await;

        let response = h.recv().await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handle_ping_and_parse_error() {
        let mut h = start(Arc::new(Notify::new()));
        h.client.write_all(b"not json\n").await.unwrap();
        h.send(json!({ "jsonrpc": "2.0", "id": 6, "method": "ping" }))
            .await;

        let parse_error = h.recv().await;
        assert_eq!(parse_error["error"]["code"], PARSE_ERROR);
        assert!(parse_error["id"].is_null());

        let pong = h.recv().await;
        assert_eq!(pong["id"], 6);
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_serving() {
        let mut h = start(Arc::new(Notify::new()));
        h.client.write_all(b"\xff\xfe garbage\n").await.unwrap();
        h.send(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
            .await;

        let parse_error = h.recv().await;
        assert_eq!(parse_error["error"]["code"], PARSE_ERROR);
        assert!(parse_error["id"].is_null());

        let pong = h.recv().await;
        assert_eq!(pong["id"], 1);
        assert_eq!(pong["result"], json!({}));
        assert!(!h.server.is_finished());
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_others() {
        let release = Arc::new(Notify::new());
        let mut h = start(release.clone());

        h.send(json!({
            "jsonrpc": "2.0", "id": 10, "method": "tools/call",
            "params": { "name": "slow_tool" }
        }))
        .await;
        h.send(json!({ "jsonrpc": "2.0", "id": 11, "method": "tools/list" }))
            .await;

        assert_eq!(h.recv().await["id"], 11);
        release.notify_one();
        assert_eq!(h.recv().await["id"], 10);
    }

    #[tokio::test]
    async fn test_eof_waits_for_in_flight_requests() {
        let release = Arc::new(Notify::new());
        let mut h = start(release.clone());

        h.send(json!({
            "jsonrpc": "2.0", "id": 20, "method": "tools/call",
            "params": { "name": "slow_tool" }
        }))
        .await;
        h.client.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.server.is_finished());

        release.notify_one();
        let response = h.recv().await;
        assert_eq!(response["id"], 20);
        assert_eq!(response["result"]["content"][0]["text"], "slow");

        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_request_gets_no_response() {
        let release = Arc::new(Notify::new());
        let mut h = start(release.clone());

        h.send(json!({
            "jsonrpc": "2.0", "id": 30, "method": "tools/call",
            "params": { "name": "slow_tool" }
        }))
        .await;
        h.send(json!({
            "jsonrpc": "2.0", "method": "notifications/cancelled",
            "params": { "requestId": 30, "reason": "user abort" }
        }))
        .await;
        h.send(json!({ "jsonrpc": "2.0", "id": 31, "method": "ping" }))
            .await;

        assert_eq!(h.recv().await["id"], 31);

        h.client.shutdown().await.unwrap();
        h.server.await.unwrap().unwrap();
        let trailing = h.responses.next_line().await.unwrap();
        assert!(trailing.is_none(), "unexpected response: {trailing:?}");
    }
}
