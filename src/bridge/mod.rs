// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Tool-level session facade over one child MCP server.
mod gateway;
/// Maps upstream MCP tool requests onto the gateway.
mod handler;

pub use gateway::{GatewayOptions, ToolGateway};
pub use handler::ProxyHandler;
