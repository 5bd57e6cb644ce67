// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock MCP server for testing.
//!
//! Speaks MCP over stdin/stdout using newline-delimited JSON-RPC. CLI flags
//! control failure modes and ordering. No tokio, plain blocking I/O.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Mock MCP server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockmcp")]
#[allow(
    clippy::struct_excessive_bools,
    reason = "CLI flags are inherently boolean"
)]
struct Args {
    /// Server name reported in `initialize`.
    #[arg(long, default_value = "mockmcp")]
    name: String,

    /// Instructions reported in `initialize`.
    #[arg(long)]
    instructions: Option<String>,

    /// Exit after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Write a non-JSON line before every response.
    #[arg(long)]
    garbage: bool,

    /// Hold `tools/call` responses until n are pending, then send them in reverse.
    #[arg(long)]
    reverse_batch: Option<usize>,

    /// After `notifications/initialized`, send a log notification and a ping request.
    #[arg(long)]
    notify_on_initialized: bool,

    /// Write this line to stderr at startup.
    #[arg(long)]
    banner: Option<String>,

    /// Keep running after stdin closes (simulate a child that ignores EOF).
    #[arg(long)]
    linger: bool,

    /// Block SIGTERM so only a kill stops the process.
    #[arg(long)]
    ignore_sigterm: bool,
}

/// An incoming JSON-RPC message.
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl Response {
    const fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    const fn err(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production,
/// or a shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

/// Create a writer that forwards to stdout.
fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

/// Write adapter for `Arc<Mutex<Vec<u8>>>` used in tests.
#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Shared state for the mock server.
struct MockServer {
    args: Args,
    response_count: u64,
    held: Vec<Response>,
    writer: Writer,
    next_request_id: u64,
}

/// Outcome of handling one message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

impl MockServer {
    const fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            response_count: 0,
            held: Vec::new(),
            writer,
            next_request_id: 1,
        }
    }

    /// Run the server, reading lines from the given reader.
    fn run(&mut self, reader: &mut dyn BufRead) -> Flow {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return Flow::Continue,
                Ok(_) => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(message) = serde_json::from_str::<Incoming>(trimmed) else {
                continue;
            };

            if self.handle_message(message) == Flow::Exit {
                return Flow::Exit;
            }
        }
    }

    fn handle_message(&mut self, message: Incoming) -> Flow {
        let Some(method) = message.method.clone() else {
            // A response to one of our requests.
            return Flow::Continue;
        };

        match message.id {
            Some(id) => self.handle_request(&method, id, &message.params),
            None => {
                self.handle_notification(&method);
                Flow::Continue
            }
        }
    }

    fn handle_request(&mut self, method: &str, id: Value, params: &Value) -> Flow {
        // hang_on: never respond
        if self.args.hang_on.iter().any(|m| m == method) {
            return Flow::Continue;
        }

        // fail_on: answer with `InternalError`
        if self.args.fail_on.iter().any(|m| m == method) {
            return self.send_response(&Response::err(
                id,
                -32603,
                format!("mockmcp: configured to fail on {method}"),
            ));
        }

        let response = match method {
            "initialize" => Response::ok(id, self.handle_initialize(params)),
            "ping" => Response::ok(id, json!({})),
            "tools/list" => Response::ok(id, tool_list()),
            "tools/call" => match call_tool(params) {
                Ok(result) => Response::ok(id, result),
                Err(message) => Response::err(id, -32602, message),
            },
            _ => Response::err(id, -32601, format!("mockmcp: method not found: {method}")),
        };

        if method == "tools/call"
            && let Some(batch) = self.args.reverse_batch
        {
            self.held.push(response);
            if self.held.len() < batch {
                return Flow::Continue;
            }
            let held = std::mem::take(&mut self.held);
            for response in held.iter().rev() {
                if self.send_response(response) == Flow::Exit {
                    return Flow::Exit;
                }
            }
            return Flow::Continue;
        }

        self.send_response(&response)
    }

    fn handle_notification(&mut self, method: &str) {
        if method == "notifications/initialized" && self.args.notify_on_initialized {
            send_message(
                &self.writer,
                &json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": { "level": "info", "data": "mockmcp ready" }
                }),
            );
            let id = self.next_request_id;
            self.next_request_id += 1;
            send_message(
                &self.writer,
                &json!({ "jsonrpc": "2.0", "id": format!("mock-{id}"), "method": "ping" }),
            );
        }
        // notifications/cancelled and all others are silently accepted
    }

    fn handle_initialize(&self, params: &Value) -> Value {
        let protocol_version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("2024-11-05");

        let mut result = json!({
            "protocolVersion": protocol_version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": self.args.name, "version": "0.0.1" }
        });
        if let Some(instructions) = &self.args.instructions {
            result["instructions"] = json!(instructions);
        }
        result
    }

    fn send_response(&mut self, response: &Response) -> Flow {
        let Ok(json) = serde_json::to_string(response) else {
            return Flow::Continue;
        };

        if self.args.garbage {
            write_line(&self.writer, "mockmcp: this line is not JSON");
        }
        write_line(&self.writer, &json);

        self.response_count += 1;

        if let Some(max) = self.args.drop_after
            && self.response_count >= max
        {
            return Flow::Exit;
        }
        Flow::Continue
    }
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echo the `text` argument back.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }
            },
            {
                "name": "add",
                "description": "Add two numbers.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "a": { "type": "number" }, "b": { "type": "number" } }
                }
            },
            {
                "name": "env",
                "description": "Read an environment variable of the server process.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "name": { "type": "string" } }
                }
            },
            {
                "name": "sleep",
                "description": "Wait `ms` milliseconds, then answer.",
                "inputSchema": {
                    "type": "object",
                    "properties": { "ms": { "type": "integer" } }
                }
            },
            {
                "name": "broken",
                "description": "Always reports a tool-level error.",
                "inputSchema": { "type": "object" }
            }
        ]
    })
}

fn text_result(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

fn call_tool(params: &Value) -> Result<Value, String> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    match name {
        "echo" => Ok(text_result(
            arguments
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )),
        "add" => {
            let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            Ok(text_result((a + b).to_string()))
        }
        "env" => {
            let key = arguments.get("name").and_then(Value::as_str).unwrap_or_default();
            Ok(text_result(std::env::var(key).unwrap_or_default()))
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(text_result(format!("slept {ms}ms")))
        }
        "broken" => Ok(json!({
            "content": [{ "type": "text", "text": "mockmcp: broken tool" }],
            "isError": true
        })),
        _ => Err(format!("Unknown tool: {name}")),
    }
}

/// Write one JSON-RPC line.
fn write_line(writer: &Writer, line: &str) {
    let Ok(mut w) = writer.lock() else { return };
    let _ = w.write_all(line.as_bytes());
    let _ = w.write_all(b"\n");
    let _ = w.flush();
}

/// Send a JSON-RPC message to the client.
fn send_message(writer: &Writer, value: &Value) {
    let Ok(json) = serde_json::to_string(value) else {
        return;
    };
    write_line(writer, &json);
}

#[cfg(unix)]
fn block_sigterm() {
    use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};

    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    if let Err(e) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        let _ = writeln!(std::io::stderr(), "mockmcp: cannot block SIGTERM: {e}");
    }
}

#[cfg(not(unix))]
fn block_sigterm() {}

fn main() {
    let args = Args::parse();

    if let Some(banner) = &args.banner {
        let _ = writeln!(std::io::stderr(), "{banner}");
    }

    if args.ignore_sigterm {
        block_sigterm();
    }

    let linger = args.linger;
    let writer = stdout_writer();
    let mut server = MockServer::new(args, writer);
    let mut stdin = std::io::stdin().lock();

    match server.run(&mut stdin) {
        Flow::Exit => std::process::exit(1),
        Flow::Continue if linger => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
        Flow::Continue => {}
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_args() -> Args {
        Args {
            name: "mockmcp".to_string(),
            instructions: None,
            drop_after: None,
            hang_on: vec![],
            fail_on: vec![],
            garbage: false,
            reverse_batch: None,
            notify_on_initialized: false,
            banner: None,
            linger: false,
            ignore_sigterm: false,
        }
    }

    fn run_server_with(args: Args, input: &[Value]) -> (Flow, Vec<String>) {
        let (writer, buf) = buffer_writer();
        let mut server = MockServer::new(args, writer);
        let text: String = input.iter().map(|v| format!("{v}\n")).collect();
        let mut reader = Cursor::new(text.into_bytes());
        let flow = server.run(&mut reader);
        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let lines = String::from_utf8_lossy(&data)
            .lines()
            .map(ToString::to_string)
            .collect();
        (flow, lines)
    }

    fn parse(lines: &[String]) -> Vec<Value> {
        lines
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    fn initialize_request(id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0" }
            }
        })
    }

    fn call_request(id: u64, name: &str, arguments: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        })
    }

    #[test]
    fn test_initialize_response_valid() {
        let mut args = default_args();
        args.instructions = Some("Be nice.".to_string());

        let (_, lines) = run_server_with(args, &[initialize_request(1)]);
        let messages = parse(&lines);

        assert_eq!(messages.len(), 1);
        let resp = &messages[0];
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(resp["result"]["serverInfo"]["name"], "mockmcp");
        assert_eq!(resp["result"]["instructions"], "Be nice.");
        assert!(resp["result"]["capabilities"]["tools"].is_object());
        assert!(resp["error"].is_null());
    }

    #[test]
    fn test_tools_list_and_call() {
        let input = [
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
            call_request(2, "echo", &json!({ "text": "hi" })),
            call_request(3, "add", &json!({ "a": 2, "b": 3 })),
            call_request(4, "broken", &json!({})),
        ];
        let (_, lines) = run_server_with(default_args(), &input);
        let messages = parse(&lines);

        assert_eq!(messages.len(), 4);
        let names: Vec<&str> = messages[0]["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"echo"));
        assert_eq!(messages[1]["result"]["content"][0]["text"], "hi");
        assert_eq!(messages[2]["result"]["content"][0]["text"], "5");
        assert_eq!(messages[3]["result"]["isError"], true);
    }

    #[test]
    fn test_unknown_tool_is_error_response() {
        let (_, lines) =
            run_server_with(default_args(), &[call_request(7, "nope", &json!({}))]);
        let messages = parse(&lines);
        assert_eq!(messages[0]["error"]["code"], -32602);
        assert_eq!(messages[0]["error"]["message"], "Unknown tool: nope");
    }

    #[test]
    fn test_fail_on_and_hang_on() {
        let mut args = default_args();
        args.fail_on = vec!["tools/list".to_string()];
        args.hang_on = vec!["ping".to_string()];

        let input = [
            json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        ];
        let (_, lines) = run_server_with(args, &input);
        let messages = parse(&lines);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["id"], 2);
        assert_eq!(messages[0]["error"]["code"], -32603);
    }

    #[test]
    fn test_drop_after_stops_reading() {
        let mut args = default_args();
        args.drop_after = Some(1);

        let input = [
            initialize_request(1),
            json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }),
        ];
        let (flow, lines) = run_server_with(args, &input);

        assert_eq!(flow, Flow::Exit);
        assert_eq!(parse(&lines).len(), 1);
    }

    #[test]
    fn test_garbage_lines_precede_responses() {
        let mut args = default_args();
        args.garbage = true;

        let (_, lines) = run_server_with(
            args,
            &[json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })],
        );

        assert_eq!(lines.len(), 2);
        assert!(serde_json::from_str::<Value>(&lines[0]).is_err());
        assert_eq!(parse(&lines)[0]["id"], 1);
    }

    #[test]
    fn test_reverse_batch() {
        let mut args = default_args();
        args.reverse_batch = Some(3);

        let input: Vec<Value> = (1..=3)
            .map(|i| call_request(i, "echo", &json!({ "text": i.to_string() })))
            .collect();
        let (_, lines) = run_server_with(args, &input);
        let ids: Vec<u64> = parse(&lines).iter().filter_map(|m| m["id"].as_u64()).collect();

        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_notify_on_initialized() {
        let mut args = default_args();
        args.notify_on_initialized = true;

        let (_, lines) = run_server_with(
            args,
            &[json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })],
        );
        let messages = parse(&lines);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["method"], "notifications/message");
        assert!(messages[0].get("id").is_none());
        assert_eq!(messages[1]["method"], "ping");
        assert_eq!(messages[1]["id"], "mock-1");
    }

    #[test]
    fn test_responses_from_client_are_ignored() {
        let (_, lines) = run_server_with(
            default_args(),
            &[json!({ "jsonrpc": "2.0", "id": "mock-1", "result": {} })],
        );
        assert!(lines.is_empty());
    }
}
