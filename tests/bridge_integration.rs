// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for the tool gateway against a real child process.
//!
//! Every test spawns the `mockmcp` binary and drives it through
//! `ToolGateway`, covering the handshake, tool calls, and failure modes.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_mcp::bridge::{GatewayOptions, ToolGateway};
use tether_mcp::child::{Inbound, SessionState};
use tether_mcp::config::{ChildConfig, StderrMode};
use tether_mcp::error::BridgeError;

fn mock(args: &[&str]) -> ChildConfig {
    ChildConfig {
        command: env!("CARGO_BIN_EXE_mockmcp").to_string(),
        args: args.iter().map(ToString::to_string).collect(),
        env: Vec::new(),
        inherit_env: true,
        cwd: None,
        stderr: StderrMode::Null,
    }
}

fn options(request_timeout: Duration) -> GatewayOptions {
    GatewayOptions {
        request_timeout,
        terminate_grace: Duration::from_millis(500),
        ..GatewayOptions::default()
    }
}

async fn connect(args: &[&str]) -> Result<ToolGateway> {
    ToolGateway::connect(&mock(args), options(Duration::from_secs(5)))
        .await
        .context("Failed to connect to mockmcp")
}

#[tokio::test]
async fn test_connect_list_and_call() -> Result<()> {
    let gateway = connect(&["--instructions", "Use echo."]).await?;
    assert_eq!(gateway.state(), SessionState::Ready);

    let info = gateway
        .server_info()
        .await
        .context("handshake result missing")?;
    assert_eq!(
        info.server_info.as_ref().map(|s| s.name.as_str()),
        Some("mockmcp")
    );
    assert_eq!(info.instructions.as_deref(), Some("Use echo."));
    assert!(info.supports_tools());

    let tools = gateway.list_tools().await?;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"echo"), "echo missing from {names:?}");
    assert_eq!(gateway.cached_tools().await.len(), tools.len());

    let result = gateway.call_tool("echo", json!({ "text": "hello" })).await?;
    assert!(!result.is_error);
    assert_eq!(result.text(), "hello");

    gateway.terminate().await;
    assert_eq!(gateway.state(), SessionState::Terminated);
    Ok(())
}

#[tokio::test]
async fn test_tool_error_payload_is_verbatim() -> Result<()> {
    let gateway = connect(&[]).await?;

    match gateway.call_tool("nope", json!({})).await {
        Err(BridgeError::ToolCall { name, error }) => {
            assert_eq!(name, "nope");
            assert_eq!(error.code, -32602);
            assert_eq!(error.message, "Unknown tool: nope");
        }
        other => bail!("expected a tool call error, got {other:?}"),
    }

    // The session survives a failed call.
    assert_eq!(gateway.state(), SessionState::Ready);
    let result = gateway.call_tool("add", json!({ "a": 2, "b": 40 })).await?;
    assert_eq!(result.text(), "42");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_tool_reported_error_is_a_result() -> Result<()> {
    let gateway = connect(&[]).await?;

    let result = gateway.call_tool("broken", json!({})).await?;
    assert!(result.is_error);
    assert_eq!(result.text(), "mockmcp: broken tool");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_list_failure_is_surfaced() -> Result<()> {
    let gateway = connect(&["--fail-on", "tools/list"]).await?;

    match gateway.list_tools().await {
        Err(BridgeError::Protocol { method, error }) => {
            assert_eq!(method, "tools/list");
            assert_eq!(error.code, -32603);
        }
        other => bail!("expected a protocol error, got {other:?}"),
    }

    let result = gateway.call_tool("echo", json!({ "text": "still up" })).await?;
    assert_eq!(result.text(), "still up");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_timeout_leaves_session_ready() -> Result<()> {
    let gateway = ToolGateway::connect(
        &mock(&["--hang-on", "tools/list"]),
        options(Duration::from_millis(200)),
    )
    .await?;

    match gateway.list_tools().await {
        Err(BridgeError::Timeout { method, .. }) => assert_eq!(method, "tools/list"),
        other => bail!("expected a timeout, got {other:?}"),
    }

    assert_eq!(gateway.state(), SessionState::Ready);
    let result = gateway.call_tool("echo", json!({ "text": "after" })).await?;
    assert_eq!(result.text(), "after");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_child_exit_fails_session() -> Result<()> {
    // Exits after answering initialize and one tools/list.
    let gateway = connect(&["--drop-after", "2"]).await?;
    let mut state = gateway.subscribe_state();

    gateway.list_tools().await?;

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Failed),
    )
    .await
    .context("session never failed")??;

    match gateway.call_tool("echo", json!({ "text": "x" })).await {
        Err(BridgeError::NotReady(SessionState::Failed)) => {}
        other => bail!("expected NotReady(Failed), got {other:?}"),
    }

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_garbage_lines_are_skipped() -> Result<()> {
    let gateway = connect(&["--garbage"]).await?;

    let tools = gateway.list_tools().await?;
    assert!(!tools.is_empty());
    let result = gateway.call_tool("echo", json!({ "text": "clean" })).await?;
    assert_eq!(result.text(), "clean");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() -> Result<()> {
    let gateway = connect(&["--reverse-batch", "3"]).await?;

    let (a, b, c) = tokio::join!(
        gateway.call_tool("echo", json!({ "text": "a" })),
        gateway.call_tool("echo", json!({ "text": "b" })),
        gateway.call_tool("echo", json!({ "text": "c" })),
    );
    assert_eq!(a?.text(), "a");
    assert_eq!(b?.text(), "b");
    assert_eq!(c?.text(), "c");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure() {
    let mut child = mock(&[]);
    child.command = "/nonexistent/tether-test-binary".to_string();

    let result = ToolGateway::connect(&child, options(Duration::from_secs(1))).await;
    assert!(matches!(result, Err(BridgeError::Spawn { .. })));
}

#[tokio::test]
async fn test_handshake_failure() {
    let result = ToolGateway::connect(
        &mock(&["--fail-on", "initialize"]),
        options(Duration::from_secs(5)),
    )
    .await;
    assert!(matches!(result, Err(BridgeError::Handshake(_))));
}

#[tokio::test]
async fn test_env_overlay_reaches_child() -> Result<()> {
    let mut child = mock(&[]);
    child.env = vec!["TETHER_TEST_SECRET=s3cret=with=equals".to_string()];
    child.inherit_env = false;

    let gateway = ToolGateway::connect(&child, options(Duration::from_secs(5))).await?;
    let result = gateway
        .call_tool("env", json!({ "name": "TETHER_TEST_SECRET" }))
        .await?;
    assert_eq!(result.text(), "s3cret=with=equals");

    let result = gateway.call_tool("env", json!({ "name": "HOME" })).await?;
    assert_eq!(result.text(), "");

    gateway.terminate().await;
    Ok(())
}

#[tokio::test]
async fn test_terminate_fails_pending_call() -> Result<()> {
    let gateway = Arc::new(
        ToolGateway::connect(
            &mock(&["--hang-on", "tools/call"]),
            options(Duration::from_secs(30)),
        )
        .await?,
    );

    let caller = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.call_tool("echo", json!({ "text": "x" })).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    gateway.terminate().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .context("pending call was never resolved")??;
    assert!(matches!(outcome, Err(BridgeError::StreamEnded)));
    Ok(())
}

#[tokio::test]
async fn test_terminate_kills_lingering_child() -> Result<()> {
    let gateway = connect(&["--linger"]).await?;
    assert!(gateway.pid().await.is_some());

    tokio::time::timeout(Duration::from_secs(5), gateway.terminate())
        .await
        .context("terminate did not finish after the grace period")?;
    assert_eq!(gateway.state(), SessionState::Terminated);

    // A second terminate is a no-op.
    gateway.terminate().await;
    Ok(())
}

async fn connect_with_grace(args: &[&str], grace: Duration) -> Result<ToolGateway> {
    let options = GatewayOptions {
        terminate_grace: grace,
        ..options(Duration::from_secs(5))
    };
    ToolGateway::connect(&mock(args), options)
        .await
        .context("Failed to connect to mockmcp")
}

#[cfg(unix)]
#[tokio::test]
async fn test_terminate_signals_lingering_child_before_grace() -> Result<()> {
    // The child ignores EOF but honours SIGTERM, so terminate must not sit
    // out the whole grace period.
    let gateway = connect_with_grace(&["--linger"], Duration::from_secs(3)).await?;

    let started = Instant::now();
    gateway.terminate().await;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "terminate took {elapsed:?}");
    assert!(gateway.pid().await.is_none());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_terminate_kills_child_ignoring_sigterm() -> Result<()> {
    let gateway = connect_with_grace(
        &["--linger", "--ignore-sigterm"],
        Duration::from_millis(500),
    )
    .await?;

    tokio::time::timeout(Duration::from_secs(5), gateway.terminate())
        .await
        .context("terminate did not kill a child that ignores SIGTERM")?;
    assert_eq!(gateway.state(), SessionState::Terminated);
    assert!(gateway.pid().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_child_messages_are_published() -> Result<()> {
    let gateway = connect(&["--notify-on-initialized"]).await?;
    let mut inbound = gateway
        .take_inbound()
        .ok_or_else(|| anyhow!("inbound receiver already taken"))?;

    let first = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await?
        .context("inbound closed")?;
    match first {
        Inbound::Notification(n) => assert_eq!(n.method, "notifications/message"),
        Inbound::Request(r) => bail!("expected a notification, got request {}", r.method),
    }

    let second = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await?
        .context("inbound closed")?;
    match second {
        Inbound::Request(r) => assert_eq!(r.method, "ping"),
        Inbound::Notification(n) => bail!("expected a request, got notification {}", n.method),
    }

    // Answering the child's ping does not disturb our own traffic.
    let result = gateway.call_tool("echo", json!({ "text": "ok" })).await?;
    assert_eq!(result.text(), "ok");

    gateway.terminate().await;
    Ok(())
}
