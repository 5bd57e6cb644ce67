// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Tether MCP proxy and CLI.
//!
//! This is the main entry point for the tether stdio bridge. It can be run as
//! an MCP server that proxies a child server's tools, or as a CLI tool to list
//! and call those tools directly.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]
#![allow(clippy::print_stderr, reason = "CLI tool needs to output to stderr")]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tether_mcp::bridge::{GatewayOptions, ProxyHandler, ToolGateway};
use tether_mcp::child::{Inbound, SessionState};
use tether_mcp::cli::{self, ColorConfig};
use tether_mcp::config::{ChildConfig, Config};
use tether_mcp::mcp::{McpServer, ServerInfo};

/// Command-line arguments for tether.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Stdio bridge that spawns an MCP server and re-exposes its tools")]
#[command(version = env!("TETHER_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,

    /// Child MCP server command line (e.g., "npx -y n8n-mcp").
    /// Overrides the command and arguments from the config file.
    #[arg(long, global = true)]
    child: Option<String>,

    /// Extra environment for the child in KEY=VALUE form. Can be specified
    /// multiple times. Appended to the config file entries.
    #[arg(short, long = "env", global = true)]
    env: Vec<String>,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-request timeout in seconds. Overrides config file if set.
    #[arg(long, global = true)]
    request_timeout: Option<u64>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Subcommands supported by tether.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP proxy on stdin/stdout (default if no subcommand given).
    Serve,

    /// Connect to the child and list its tools.
    Tools {
        /// Disable colored output.
        #[arg(long)]
        nocolor: bool,
    },

    /// Connect to the child and call one tool.
    Call {
        /// Tool name.
        name: String,

        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,

        /// Print the raw JSON result instead of its text content.
        #[arg(long)]
        raw: bool,
    },
}

/// Entry point.
///
/// # Errors
///
/// Returns an error if the subcommand fails.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let config = load_config(&args)?;

    match args.command {
        None | Some(Command::Serve) => run_server(&config).await,
        Some(Command::Tools { nocolor }) => run_tools(&config, nocolor).await,
        Some(Command::Call { name, args, raw }) => run_call(&config, &name, &args, raw).await,
    }
}

/// Installs the stderr log subscriber. Stdout carries the protocol.
fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("tether={level},tether_mcp={level}"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Loads the layered configuration and applies command-line overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.clone())?;

    if let Some(timeout) = args.request_timeout {
        config.request_timeout = timeout;
    }

    if let Some(command_line) = &args.child {
        let parsed = ChildConfig::from_command_line(command_line)?;
        match config.child.as_mut() {
            Some(existing) => {
                existing.command = parsed.command;
                existing.args = parsed.args;
            }
            None => config.child = Some(parsed),
        }
    }

    if !args.env.is_empty() {
        let Some(child) = config.child.as_mut() else {
            bail!("--env given but no child MCP server is configured");
        };
        child.env.extend(args.env.iter().cloned());
    }

    if let Some(child) = &config.child {
        // Surface malformed entries before anything is spawned.
        child.env_pairs()?;
    }

    Ok(config)
}

/// Spawns the configured child and completes the handshake.
async fn connect(config: &Config) -> Result<ToolGateway> {
    let child = config.child()?;
    let gateway = ToolGateway::connect(child, GatewayOptions::from_config(config))
        .await
        .with_context(|| format!("Failed to start child MCP server '{}'", child.command))?;
    Ok(gateway)
}

/// Runs the MCP proxy.
///
/// The child session is established before the first upstream message is
/// read and is terminated on every exit path. A child that fails while
/// serving ends the proxy with an error.
///
/// # Errors
///
/// Returns an error if the child cannot be started or stdio fails.
async fn run_server(config: &Config) -> Result<()> {
    info!("Starting tether proxy");
    let gateway = Arc::new(connect(config).await?);

    // Child notifications and requests have no upstream consumer.
    let drain_handle = gateway.take_inbound().map(|mut inbound| {
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match message {
                    Inbound::Notification(n) => debug!("Child notification: {}", n.method),
                    Inbound::Request(r) => debug!("Child request: {}", r.method),
                }
            }
        })
    });

    let child_info = gateway.server_info().await;
    if let Some(info) = child_info.as_ref().and_then(|r| r.server_info.as_ref()) {
        info!(
            "Proxying {} {}",
            info.name,
            info.version.as_deref().unwrap_or("")
        );
    }

    let handler = ProxyHandler::new(gateway.clone())
        .empty_tools_on_error(config.proxy.empty_tools_on_error);
    let server_info = ServerInfo {
        name: config.proxy.name.clone(),
        version: Some(
            config
                .proxy
                .version
                .clone()
                .unwrap_or_else(|| env!("TETHER_VERSION").to_string()),
        ),
    };
    let server = McpServer::new(handler, server_info)
        .with_instructions(child_info.and_then(|r| r.instructions));

    // Wait for upstream EOF, a failed child, or a termination signal
    let mut state = gateway.subscribe_state();
    let result = tokio::select! {
        res = server.run() => res,
        Ok(_) = state.wait_for(|s| *s == SessionState::Failed) => {
            error!("Child MCP server failed, shutting down");
            Err(anyhow!("child MCP server failed"))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down child MCP server");
    gateway.terminate().await;

    if let Some(handle) = drain_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

/// Lists the child's tools as a table.
///
/// # Errors
///
/// Returns an error if the child cannot be started or the listing fails.
async fn run_tools(config: &Config, nocolor: bool) -> Result<()> {
    let gateway = connect(config).await?;
    let listed = gateway.list_tools().await;
    gateway.terminate().await;

    let tools = listed.context("tools/list failed")?;
    let colors = ColorConfig::new(nocolor);
    println!(
        "{}",
        cli::render_tool_table(&tools, &colors, cli::terminal_width())
    );
    Ok(())
}

/// Calls one tool and prints its result.
///
/// # Errors
///
/// Returns an error if the arguments are not a JSON object, the call fails,
/// or the tool reports an error.
async fn run_call(config: &Config, name: &str, arguments: &str, raw: bool) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(arguments).context("--args is not valid JSON")?;
    if !arguments.is_object() {
        bail!("--args must be a JSON object");
    }

    let gateway = connect(config).await?;
    let called = gateway.call_tool(name, arguments).await;
    gateway.terminate().await;

    let result = called.with_context(|| format!("tools/call {name} failed"))?;

    if raw {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let rendered = cli::render_tool_result(&result);
        if result.is_error {
            let colors = ColorConfig::new(false);
            eprintln!("{}", colors.red(&rendered));
        } else {
            println!("{rendered}");
        }
    }

    if result.is_error {
        warn!("Tool {} reported an error", name);
        bail!("tool '{name}' reported an error");
    }
    Ok(())
}
