// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for configuration loading and merging.
//!
//! Verifies that tether correctly loads settings from files, environment
//! variables, and CLI arguments in the correct priority order.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Output};

/// Runs `tether` with an isolated config home and returns its output.
fn tether(config_home: &Path, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_tether"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .envs(env.iter().copied())
        .output()
        .context("Failed to run tether")
}

fn write_config(dir: &Path, name: &str, body: &str) -> Result<String> {
    let path = dir.join(name);
    std::fs::write(&path, body)?;
    path.to_str()
        .map(ToString::to_string)
        .context("config path is not UTF-8")
}

fn child_table(extra: &str) -> String {
    format!(
        "[child]\ncommand = {:?}\nstderr = \"null\"\n{extra}\n",
        env!("CARGO_BIN_EXE_mockmcp")
    )
}

#[test]
fn test_child_from_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        dir.path(),
        "tether.toml",
        &child_table("env = [\"FROM_CONFIG=file value\"]"),
    )?;

    let output = tether(
        dir.path(),
        &["--config", &config, "call", "env", "--args", r#"{"name":"FROM_CONFIG"}"#],
        &[],
    )?;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "file value");
    Ok(())
}

#[test]
fn test_user_config_directory_is_read() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("tether"))?;
    write_config(
        &dir.path().join("tether"),
        "config.toml",
        &child_table("args = [\"--name\", \"from-user-dir\"]"),
    )?;

    let output = tether(dir.path(), &["tools", "--nocolor"], &[])?;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("echo"));
    Ok(())
}

#[test]
fn test_cli_env_appends_to_config_env() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        dir.path(),
        "tether.toml",
        &child_table("env = [\"FIRST=one\"]"),
    )?;

    let output = tether(
        dir.path(),
        &[
            "--config",
            &config,
            "--env",
            "SECOND=two",
            "call",
            "env",
            "--args",
            r#"{"name":"SECOND"}"#,
        ],
        &[],
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "two");

    let output = tether(
        dir.path(),
        &[
            "--config",
            &config,
            "--env",
            "SECOND=two",
            "call",
            "env",
            "--args",
            r#"{"name":"FIRST"}"#,
        ],
        &[],
    )?;
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "one");
    Ok(())
}

#[test]
fn test_cli_child_overrides_config_command() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        dir.path(),
        "tether.toml",
        "[child]\ncommand = \"/nonexistent/never-run\"\nenv = [\"KEPT=yes\"]\nstderr = \"null\"\n",
    )?;

    let output = tether(
        dir.path(),
        &[
            "--config",
            &config,
            "--child",
            env!("CARGO_BIN_EXE_mockmcp"),
            "call",
            "env",
            "--args",
            r#"{"name":"KEPT"}"#,
        ],
        &[],
    )?;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "yes");
    Ok(())
}

#[test]
fn test_environment_overrides_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        dir.path(),
        "tether.toml",
        "[child]\ncommand = \"/nonexistent/never-run\"\nstderr = \"null\"\n",
    )?;

    let output = tether(
        dir.path(),
        &["--config", &config, "tools", "--nocolor"],
        &[("TETHER_CHILD__COMMAND", env!("CARGO_BIN_EXE_mockmcp"))],
    )?;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("tool(s)"));
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        dir.path(),
        "tether.toml",
        &child_table("").replace("\"null\"", "\"sometimes\""),
    )?;

    let output = tether(dir.path(), &["--config", &config, "tools"], &[])?;

    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("Failed to deserialize configuration")
    );
    Ok(())
}

#[test]
fn test_missing_child_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let output = tether(dir.path(), &["tools"], &[])?;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No child MCP server configured"));
    Ok(())
}

#[test]
fn test_malformed_env_entry_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let output = tether(
        dir.path(),
        &["--child", env!("CARGO_BIN_EXE_mockmcp"), "--env", "NOEQUALS", "tools"],
        &[],
    )?;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid env entry: NOEQUALS"));
    Ok(())
}
