// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// MCP server implementation over stdin/stdout.
mod server;
/// MCP type definitions.
mod types;

pub use server::{McpServer, ToolHandler};
pub use types::{
    CallToolParams, ClientInfo, InitializeParams, InitializeResult, ListToolsResult, ServerInfo,
    ToolContent, ToolDescriptor, ToolResult,
};
