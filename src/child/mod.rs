// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Session with one child MCP server: process, framing, correlation and the
//! initialize exchange.

pub mod correlator;
pub mod handshake;
pub mod state;
pub mod transport;

pub use correlator::{Correlator, Inbound};
pub use handshake::HandshakeOptions;
pub use state::{SessionState, StateTracker};
pub use transport::{LineReader, Transport};
