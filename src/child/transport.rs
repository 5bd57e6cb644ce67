// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Newline-framed byte exchange with one child process.

use bytes::BytesMut;
use serde::Serialize;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{ChildConfig, StderrMode};
use crate::error::BridgeError;
use crate::protocol::{self, Message};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of the pipe pair plus the process that owns it.
///
/// Reading happens through the [`LineReader`] handed out alongside, so one
/// reader and one writer can run concurrently.
pub struct Transport {
    label: String,
    writer: Mutex<Option<BoxedWriter>>,
    child: Mutex<Option<Child>>,
    grace: Duration,
}

impl Transport {
    /// Spawns the child and returns the transport with its line reader.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] if the executable cannot be found, the
    /// OS refuses to create the process, or the env entries are malformed.
    pub fn spawn(config: &ChildConfig, grace: Duration) -> Result<(Self, LineReader), BridgeError> {
        let spawn_error = |source: std::io::Error| BridgeError::Spawn {
            program: config.command.clone(),
            source,
        };

        let env = config
            .env_pairs()
            .map_err(|e| spawn_error(std::io::Error::new(ErrorKind::InvalidInput, e.to_string())))?;

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match config.stderr {
                StderrMode::Log => Stdio::piped(),
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Null => Stdio::null(),
            })
            .kill_on_drop(true);

        if !config.inherit_env {
            command.env_clear();
        }
        command.envs(env);

        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("child stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("child stdout not captured")))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, config.command.clone()));
        }

        info!(
            "Spawned child: {} {} (pid {})",
            config.command,
            config.args.join(" "),
            child.id().map_or_else(|| "?".to_string(), |pid| pid.to_string())
        );

        let transport = Self {
            label: config.command.clone(),
            writer: Mutex::new(Some(Box::new(stdin))),
            child: Mutex::new(Some(child)),
            grace,
        };

        Ok((transport, LineReader::new(stdout)))
    }

    /// Builds a transport over arbitrary byte streams, with no process behind it.
    pub fn attach<R, W>(reader: R, writer: W) -> (Self, LineReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Self {
            label: "attached".to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            child: Mutex::new(None),
            grace: Duration::ZERO,
        };
        (transport, LineReader::new(reader))
    }

    /// Writes `message` as one line.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Write`] if the pipe is closed, or
    /// [`BridgeError::Encode`] if the message does not serialize.
    pub async fn send_line<T: Serialize>(&self, message: &T) -> Result<(), BridgeError> {
        let line = protocol::encode_line(message).map_err(BridgeError::Encode)?;
        trace!("Sending to {}: {}", self.label, String::from_utf8_lossy(&line).trim_end());

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            BridgeError::Write(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "child stdin already closed",
            ))
        })?;

        writer.write_all(&line).await.map_err(BridgeError::Write)?;
        writer.flush().await.map_err(BridgeError::Write)
    }

    /// Sets how long [`terminate`](Self::terminate) waits at each step.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Closes stdin, signals the child to exit, waits up to the grace period,
    /// then kills. Idempotent.
    ///
    /// A writer stuck on a full pipe does not hold this up: closing stdin
    /// gives up after the grace period and the signal path still runs.
    pub async fn terminate(&self) {
        // Closing stdin is the stdio transport's shutdown signal.
        let close_stdin = async {
            if let Some(mut writer) = self.writer.lock().await.take()
                && let Err(e) = writer.shutdown().await
            {
                debug!("Closing stdin of {} failed: {}", self.label, e);
            }
        };
        if tokio::time::timeout(self.grace, close_stdin).await.is_err() {
            warn!(
                "Could not close stdin of {} within {:?}",
                self.label, self.grace
            );
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        request_exit(&child, &self.label);

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => info!("Child {} exited: {}", self.label, status),
            Ok(Err(e)) => warn!("Failed to wait for child {}: {}", self.label, e),
            Err(_) => {
                warn!(
                    "Child {} did not exit within {:?}, killing",
                    self.label, self.grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill child {}: {}", self.label, e);
                }
            }
        }
    }

    /// OS-level liveness check.
    ///
    /// Without a process behind it, reports whether the write side is open.
    pub async fn is_running(&self) -> bool {
        if let Some(child) = self.child.lock().await.as_mut() {
            return matches!(child.try_wait(), Ok(None));
        }
        self.writer.lock().await.is_some()
    }

    /// Process ID of the child, if one is still owned.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }
}

/// Read side: yields one decoded message per line.
pub struct LineReader {
    reader: BoxedReader,
    buffer: BytesMut,
    eof: bool,
}

impl LineReader {
    fn new<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        Self {
            reader: Box::new(reader),
            buffer: BytesMut::with_capacity(8192),
            eof: false,
        }
    }

    /// Waits for the next line.
    ///
    /// Returns `Ok(None)` at end of stream. Blank lines are skipped. A read
    /// error is logged and treated as end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Decode`] for a line that is not a JSON-RPC
    /// message. The reader stays usable.
    pub async fn read_line(&mut self) -> Result<Option<Message>, BridgeError> {
        loop {
            if let Some(line) = protocol::try_parse_line(&mut self.buffer) {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return decode(&line).map(Some);
            }

            if self.eof {
                // A final line may lack its terminator.
                let rest = self.buffer.split();
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return decode(&rest).map(Some);
            }

            let mut temp = [0u8; 4096];
            match self.reader.read(&mut temp).await {
                Ok(0) => {
                    debug!("Child stdout closed");
                    self.eof = true;
                }
                Ok(n) => self.buffer.extend_from_slice(&temp[..n]),
                Err(e) => {
                    warn!("Error reading from child stdout: {}", e);
                    self.eof = true;
                }
            }
        }
    }
}

/// Sends SIGTERM. A child that already exited has no pid and is skipped.
#[cfg(unix)]
fn request_exit(child: &Child, label: &str) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!("Failed to signal child {}: {}", label, e);
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child, _label: &str) {}

fn decode(line: &[u8]) -> Result<Message, BridgeError> {
    trace!("Received: {}", String::from_utf8_lossy(line));
    serde_json::from_slice(line)
        .and_then(Message::from_value)
        .map_err(|source| BridgeError::Decode {
            line: String::from_utf8_lossy(line).into_owned(),
            source,
        })
}

async fn forward_stderr(stderr: ChildStderr, program: String) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(target: "tether_mcp::child::stderr", "[{}] {}", program, text);
                }
            }
            Err(e) => {
                debug!("Stopped reading stderr of {}: {}", program, e);
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::protocol::RequestMessage;
    use std::sync::Arc;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_send_line_writes_one_line() {
        let (ours, theirs) = duplex(4096);
        let (input, _) = duplex(16);
        let (transport, _reader) = Transport::attach(input, ours);

        transport
            .send_line(&RequestMessage::new(1, "tools/list", None))
            .await
            .unwrap();

        let mut lines = BufReader::new(theirs).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "tools/list");
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_reading() {
        let (mut child_out, ours) = duplex(4096);
        let (_, sink) = duplex(16);
        let (_transport, mut reader) = Transport::attach(ours, sink);

        child_out
            .write_all(b"npm WARN something odd\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .await
            .unwrap();
        drop(child_out);

        let first = reader.read_line().await;
        assert!(matches!(first, Err(BridgeError::Decode { ref line, .. }) if line == "npm WARN something odd"));

        let second = reader.read_line().await.unwrap();
        assert!(matches!(second, Some(Message::Response(_))));

        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_final_line_without_newline() {
        let (mut child_out, ours) = duplex(4096);
        let (_, sink) = duplex(16);
        let (_transport, mut reader) = Transport::attach(ours, sink);

        child_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}")
            .await
            .unwrap();
        drop(child_out);

        let message = reader.read_line().await.unwrap();
        assert!(matches!(message, Some(Message::Notification(_))));
        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let (mut child_out, ours) = duplex(4096);
        let (_, sink) = duplex(16);
        let (_transport, mut reader) = Transport::attach(ours, sink);

        let task = tokio::spawn(async move { reader.read_line().await });
        child_out.write_all(b"{\"jsonrpc\":\"2.0\",").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        child_out.write_all(b"\"id\":7,\"result\":null}\n").await.unwrap();

        let message = task.await.unwrap().unwrap();
        assert!(
            matches!(message, Some(Message::Response(r)) if r.id == Some(crate::protocol::RequestId::Number(7)))
        );
    }

    #[tokio::test]
    async fn test_send_after_terminate_fails() {
        let (ours, _theirs) = duplex(4096);
        let (input, _) = duplex(16);
        let (transport, _reader) = Transport::attach(input, ours);

        transport.terminate().await;
        transport.terminate().await;

        let result = transport
            .send_line(&RequestMessage::new(1, "ping", None))
            .await;
        assert!(matches!(result, Err(BridgeError::Write(_))));
        assert!(!transport.is_running().await);
    }

    #[tokio::test]
    async fn test_terminate_does_not_wait_on_stalled_writer() {
        // Nobody reads `_theirs`, so a large write blocks holding the writer.
        let (ours, _theirs) = duplex(64);
        let (input, _) = duplex(16);
        let (transport, _reader) = Transport::attach(input, ours);
        let transport = Arc::new(transport.with_grace(Duration::from_millis(100)));

        let stalled = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .send_line(&serde_json::json!({ "blob": "x".repeat(4096) }))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), transport.terminate())
            .await
            .expect("terminate finished while a write was stuck");
        stalled.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_signals_before_killing() {
        // `sleep` ignores stdin EOF but exits on SIGTERM.
        let mut config = ChildConfig::from_command_line("sleep 30").expect("valid command line");
        config.stderr = StderrMode::Null;
        let (transport, _reader) =
            Transport::spawn(&config, Duration::from_secs(5)).expect("sleep spawns");

        let started = std::time::Instant::now();
        transport.terminate().await;

        assert!(
            started.elapsed() < Duration::from_secs(3),
            "child was only stopped by the kill fallback"
        );
        assert!(transport.pid().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let config = ChildConfig::from_command_line("tether-definitely-not-a-real-binary --x")
            .expect("valid command line");
        let result = Transport::spawn(&config, Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(BridgeError::Spawn { ref program, .. }) if program == "tether-definitely-not-a-real-binary"
        ));
    }

    #[tokio::test]
    async fn test_spawn_rejects_malformed_env() {
        let mut config = ChildConfig::from_command_line("true").expect("valid command line");
        config.env = vec!["NO_EQUALS_SIGN".to_string()];
        let result = Transport::spawn(&config, Duration::from_secs(1));
        assert!(matches!(result, Err(BridgeError::Spawn { .. })));
    }
}
