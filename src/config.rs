// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Protocol revision sent in `initialize` unless configured otherwise.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Timeout for the whole initialize exchange in seconds (default: 30)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Seconds to wait for the child to exit after stdin closes (default: 5)
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace: u64,

    /// Protocol version advertised in `initialize`
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// The MCP server to spawn
    #[serde(default)]
    pub child: Option<ChildConfig>,

    /// Upstream-facing settings used by `tether serve`
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChildConfig {
    /// The command to execute (e.g., "node")
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment as `KEY=VALUE` entries, passed through untouched
    #[serde(default)]
    pub env: Vec<String>,

    /// Start from the parent's environment (default: true)
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// Working directory for the child
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// What to do with the child's stderr
    #[serde(default)]
    pub stderr: StderrMode,
}

/// Disposition of the child's stderr.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Forward each line to the log.
    #[default]
    Log,
    /// Share the parent's stderr.
    Inherit,
    /// Discard.
    Null,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Server name reported to the upstream client
    #[serde(default = "default_proxy_name")]
    pub name: String,

    /// Server version reported upstream (defaults to the crate version)
    #[serde(default)]
    pub version: Option<String>,

    /// Answer a failed `tools/list` with an empty list instead of an error
    #[serde(default)]
    pub empty_tools_on_error: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: default_proxy_name(),
            version: None,
            empty_tools_on_error: false,
        }
    }
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_handshake_timeout() -> u64 {
    30
}

const fn default_terminate_grace() -> u64 {
    5
}

const fn default_true() -> bool {
    true
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_proxy_name() -> String {
    "tether".to_string()
}

impl ChildConfig {
    /// Builds a child definition from a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the command line is empty.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| anyhow!("child command cannot be empty"))?
            .to_string();

        Ok(Self {
            command,
            args: parts.map(ToString::to_string).collect(),
            env: Vec::new(),
            inherit_env: true,
            cwd: None,
            stderr: StderrMode::default(),
        })
    }

    /// Parses the `KEY=VALUE` entries.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first entry without `=` or with an empty key.
    pub fn env_pairs(&self) -> Result<Vec<(String, String)>> {
        self.env
            .iter()
            .map(|entry| {
                let (key, value) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Invalid env entry: {entry}. Expected 'KEY=VALUE'"))?;
                if key.trim().is_empty() {
                    return Err(anyhow!("Invalid env entry: {entry}. Key is empty"));
                }
                Ok((key.trim().to_string(), value.to_string()))
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the merged result does
    /// not deserialize.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("request_timeout", default_request_timeout())?
            .set_default("handshake_timeout", default_handshake_timeout())?
            .set_default("terminate_grace", default_terminate_grace())?
            .set_default("protocol_version", DEFAULT_PROTOCOL_VERSION)?;

        // 2. Load from user config directory (~/.config/tether/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("tether").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Load from environment variables (TETHER_REQUEST_TIMEOUT, TETHER_CHILD__COMMAND, etc.)
        builder = builder.add_source(
            config::Environment::with_prefix("TETHER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// The configured child, or an error explaining how to set one.
    ///
    /// # Errors
    ///
    /// Returns an error if no child command is configured.
    pub fn child(&self) -> Result<&ChildConfig> {
        self.child.as_ref().ok_or_else(|| {
            anyhow!("No child MCP server configured. Use --child or set [child] command in config")
        })
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Grace period before the child is killed.
    #[must_use]
    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace)
    }
}
