// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC envelopes and newline framing shared by both sides of the bridge.
//!
//! Every message on either pipe is one UTF-8 JSON document followed by `\n`.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only JSON-RPC version spoken on either pipe.
pub const JSONRPC_VERSION: &str = "2.0";

/// The method was not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// The params were invalid.
pub const INVALID_PARAMS: i64 = -32602;
/// An internal error occurred.
pub const INTERNAL_ERROR: i64 = -32603;
/// The message could not be parsed.
pub const PARSE_ERROR: i64 = -32700;

/// Request ID can be string or number.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric ID.
    Number(i64),
    /// A string ID.
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// JSON-RPC request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// The JSON-RPC version.
    pub jsonrpc: String,
    /// The request ID.
    pub id: RequestId,
    /// The method name.
    pub method: String,
    /// The request parameters. Omitted rather than serialized as `null`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestMessage {
    /// Builds a request with the current protocol version.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no `id`, no response expected).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// The JSON-RPC version.
    pub jsonrpc: String,
    /// The method name.
    pub method: String,
    /// The notification parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationMessage {
    /// Builds a notification with the current protocol version.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// The JSON-RPC version.
    pub jsonrpc: String,
    /// The request ID. `null` only for errors about unparseable requests.
    pub id: Option<RequestId>,
    /// The result of the request, if successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error, if the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    /// Creates a successful response.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the result cannot be converted to JSON.
    pub fn success(id: RequestId, result: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    /// Creates an error response.
    pub fn failure(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponseError {
    /// The error code.
    pub code: i64,
    /// The error message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Creates an error object without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// One decoded line, classified by shape.
#[derive(Debug, Clone)]
pub enum Message {
    /// Has `method` and `id`.
    Request(RequestMessage),
    /// Has `method`, no `id`.
    Notification(NotificationMessage),
    /// Has `id`, no `method`.
    Response(ResponseMessage),
}

impl Message {
    /// Classifies a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object or does not fit any of
    /// the three envelope shapes.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if !value.is_object() {
            return Err(serde::de::Error::custom("expected a JSON-RPC object"));
        }

        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Self::Request),
            (true, false) => serde_json::from_value(value).map(Self::Notification),
            (false, _) => serde_json::from_value(value).map(Self::Response),
        }
    }

    /// Decodes one line of text.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not valid JSON or not a JSON-RPC object.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }
}

/// Serializes a message as one newline-terminated line.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Splits one complete line off the front of `buffer`.
///
/// Returns `None` until a `\n` is buffered. The terminator and an optional
/// preceding `\r` are stripped.
pub fn try_parse_line(buffer: &mut BytesMut) -> Option<BytesMut> {
    let newline = buffer.iter().position(|&b| b == b'\n')?;
    let mut line = buffer.split_to(newline);
    buffer.advance(1);

    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }

    Some(line)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "Tests use unwrap and panic for clear failure messages"
)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_line() {
        let mut buffer = BytesMut::from("{\"jsonrpc\":\"2.0\",\"id\":1}\n");
        let line = try_parse_line(&mut buffer).unwrap();
        assert_eq!(&line[..], b"{\"jsonrpc\":\"2.0\",\"id\":1}");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_incomplete_line() {
        let mut buffer = BytesMut::from("{\"partial\":");
        assert!(try_parse_line(&mut buffer).is_none());
        assert_eq!(buffer.len(), 11);
    }

    #[test]
    fn test_parse_multiple_lines() {
        let mut buffer = BytesMut::from("{\"a\":1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(&try_parse_line(&mut buffer).unwrap()[..], b"{\"a\":1}");
        assert_eq!(&try_parse_line(&mut buffer).unwrap()[..], b"{\"b\":2}");
        assert!(try_parse_line(&mut buffer).is_none());
        assert_eq!(&buffer[..], b"{\"c\"");
    }

    #[test]
    fn test_parse_crlf_line() {
        let mut buffer = BytesMut::from("{\"a\":1}\r\n");
        assert_eq!(&try_parse_line(&mut buffer).unwrap()[..], b"{\"a\":1}");
    }

    #[test]
    fn test_encode_line_single_line() {
        let request = RequestMessage::new(
            1,
            "tools/call",
            Some(serde_json::json!({"name": "echo", "arguments": {"text": "a\nb"}})),
        );
        let line = encode_line(&request).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_classify_request() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":42,"method":"ping"}"#).unwrap();
        assert!(matches!(msg, Message::Request(r) if r.id == RequestId::Number(42)));
    }

    #[test]
    fn test_classify_string_id() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        assert!(matches!(msg, Message::Request(r) if r.id == RequestId::String("abc".into())));
    }

    #[test]
    fn test_classify_notification() {
        let msg =
            Message::decode(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#)
                .unwrap();
        assert!(matches!(msg, Message::Notification(n) if n.method == "notifications/message"));
    }

    #[test]
    fn test_classify_response_with_error() {
        let msg = Message::decode(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid Request"}}"#,
        )
        .unwrap();
        let Message::Response(response) = msg else {
            panic!("expected response");
        };
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[test]
    fn test_classify_rejects_non_object() {
        assert!(Message::decode("[1,2,3]").is_err());
        assert!(Message::decode("\"hello\"").is_err());
        assert!(Message::decode("not json at all").is_err());
    }

    #[test]
    fn test_none_params_omitted_not_null() {
        let json = serde_json::to_string(&RequestMessage::new(3, "tools/list", None)).unwrap();
        assert!(!json.contains("params"), "got: {json}");

        let json = serde_json::to_string(&NotificationMessage::new(
            "notifications/initialized",
            None,
        ))
        .unwrap();
        assert!(!json.contains("params"), "got: {json}");
    }

    #[test]
    fn test_failure_response_shape() {
        let response = ResponseMessage::failure(
            Some(RequestId::Number(1)),
            ResponseError::new(METHOD_NOT_FOUND, "Unknown method"),
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("-32601"));
        assert!(!json.contains("result"));
    }
}
