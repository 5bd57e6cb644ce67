// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Session lifecycle state.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::BridgeError;

/// Lifecycle of one child session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Nothing spawned yet.
    Unstarted,
    /// Spawning the child process.
    Starting,
    /// Transport is up, initialize exchange in progress.
    Handshaking,
    /// Tool operations are permitted.
    Ready,
    /// Shutdown requested.
    Terminating,
    /// Child reaped, pipes closed.
    Terminated,
    /// A session-fatal error occurred.
    Failed,
}

impl SessionState {
    /// Returns true once the session can no longer serve requests.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Returns true while the session is being or has been torn down on purpose.
    #[must_use]
    pub const fn is_shutting_down(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    /// Lowercase name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable session state.
///
/// Cloned into the reader task so end-of-stream can fail the session.
#[derive(Debug, Clone)]
pub struct StateTracker {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// Creates a tracker in `Unstarted`.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Unstarted);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Moves to `next` unconditionally.
    pub fn set(&self, next: SessionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!("Session state: {} -> {}", previous, next);
        }
    }

    /// Moves to `Failed` unless the session is already final or shutting down.
    ///
    /// Returns true if the transition happened.
    pub fn fail(&self, reason: &str) -> bool {
        let mut failed = false;
        self.tx.send_if_modified(|state| {
            if state.is_final() || state.is_shutting_down() {
                return false;
            }
            *state = SessionState::Failed;
            failed = true;
            true
        });
        if failed {
            error!("Session failed: {}", reason);
        }
        failed
    }

    /// Rejects the operation unless the session is `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] carrying the current state.
    pub fn require_ready(&self) -> Result<(), BridgeError> {
        match self.get() {
            SessionState::Ready => Ok(()),
            other => Err(BridgeError::NotReady(other)),
        }
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}
