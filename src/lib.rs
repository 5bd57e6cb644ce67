// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tether is a stdio bridge for MCP (Model Context Protocol) servers.
//!
//! It spawns an MCP server as a child process, performs the handshake, and
//! re-exposes the child's tools either to an in-process caller through
//! [`bridge::ToolGateway`] or to an upstream MCP client through
//! [`mcp::McpServer`].

/// Tool-level session facade and the upstream proxy handler.
pub mod bridge;
/// Child process transport, request correlation, and handshake.
pub mod child;
/// Command-line interface utilities.
pub mod cli;
/// Configuration handling for the child and the proxy.
pub mod config;
/// Error types shared across the bridge.
pub mod error;
/// MCP server implementation and type definitions.
pub mod mcp;
/// JSON-RPC 2.0 message types and line framing.
pub mod protocol;
