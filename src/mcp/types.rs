/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! MCP (Model Context Protocol) type definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// MCP initialize request params.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// The protocol version requested by the client.
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// The capabilities of the client, kept opaque.
    #[serde(default)]
    pub capabilities: Value,
    /// Information about the client.
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// Information about the MCP client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    /// The name of the client.
    pub name: String,
    /// The version of the client.
    #[serde(default)]
    pub version: Option<String>,
}

/// MCP initialize response result, in either direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// The protocol version the server settled on.
    #[serde(default)]
    pub protocol_version: String,
    /// The capabilities of the server, kept opaque.
    #[serde(default)]
    pub capabilities: Value,
    /// Information about the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    /// Optional instructions for the client on how to use this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Returns true if the server advertised the `tools` capability.
    #[must_use]
    pub fn supports_tools(&self) -> bool {
        self.capabilities.get("tools").is_some()
    }
}

/// Information about the MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The name of the server.
    pub name: String,
    /// The version of the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Tool definition as carried by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// The unique name of the tool.
    pub name: String,
    /// A human-readable description of the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The JSON schema for the tool's input.
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
    /// Fields we do not interpret (annotations, title, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_schema() -> Value {
    json!({})
}

/// tools/list response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// The list of available tools.
    pub tools: Vec<ToolDescriptor>,
}

/// tools/call request params.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    /// The name of the tool to call.
    pub name: String,
    /// The arguments for the tool call.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// tools/call response result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// The content returned from the tool call.
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Whether the tool ran but reported failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Fields we do not interpret (`structuredContent`, `_meta`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolResult {
    /// Text items joined with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ToolContent::Text(text) => Some(text.as_str()),
                ToolContent::Opaque(value) => value.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content returned from a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ToolContent {
    /// A plain `{"type": "text", "text": ...}` item.
    Text(String),
    /// Anything else (images, resources, annotated text), kept verbatim.
    Opaque(Value),
}

impl From<Value> for ToolContent {
    fn from(value: Value) -> Self {
        if let Value::Object(map) = &value
            && map.len() == 2
            && map.get("type").and_then(Value::as_str) == Some("text")
            && let Some(text) = map.get("text").and_then(Value::as_str)
        {
            return Self::Text(text.to_string());
        }
        Self::Opaque(value)
    }
}

impl From<ToolContent> for Value {
    fn from(content: ToolContent) -> Self {
        match content {
            ToolContent::Text(text) => json!({ "type": "text", "text": text }),
            ToolContent::Opaque(value) => value,
        }
    }
}
