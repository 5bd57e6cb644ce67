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

//! Bridge handler that forwards MCP tool requests to the child session.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::ToolGateway;
use crate::mcp::{ToolDescriptor, ToolHandler, ToolResult};
use crate::protocol::ResponseError;

/// Answers upstream `tools/list` and `tools/call` through a [`ToolGateway`].
pub struct ProxyHandler {
    gateway: Arc<ToolGateway>,
    empty_tools_on_error: bool,
}

impl ProxyHandler {
    /// Creates a handler over an established session.
    #[must_use]
    pub const fn new(gateway: Arc<ToolGateway>) -> Self {
        Self {
            gateway,
            empty_tools_on_error: false,
        }
    }

    /// Answer a failed `tools/list` with an empty list instead of an error.
    #[must_use]
    pub const fn empty_tools_on_error(mut self, enabled: bool) -> Self {
        self.empty_tools_on_error = enabled;
        self
    }
}

impl ToolHandler for ProxyHandler {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ResponseError> {
        match self.gateway.list_tools().await {
            Ok(tools) => Ok(tools),
            Err(e) if self.empty_tools_on_error => {
                warn!("tools/list failed, answering with no tools: {}", e);
                Ok(Vec::new())
            }
            Err(e) => {
                warn!("tools/list failed: {}", e);
                Err(e.to_response_error())
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ResponseError> {
        self.gateway
            .call_tool(name, arguments)
            .await
            .map_err(|e| e.to_response_error())
    }
}
