// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Matches responses to the requests that caused them.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::state::StateTracker;
use super::transport::{LineReader, Transport};
use crate::error::BridgeError;
use crate::protocol::{
    METHOD_NOT_FOUND, Message, NotificationMessage, RequestId, RequestMessage, ResponseError,
    ResponseMessage,
};

type Slot = oneshot::Sender<Result<Value, BridgeError>>;

#[derive(Default)]
struct PendingTable {
    calls: HashMap<i64, (String, Slot)>,
    closed: bool,
}

type PendingCalls = Arc<std::sync::Mutex<PendingTable>>;

/// Child-initiated messages buffered for [`Correlator::take_inbound`].
/// Beyond this, new messages are dropped.
pub const INBOUND_CAPACITY: usize = 256;

fn lock(pending: &PendingCalls) -> MutexGuard<'_, PendingTable> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Traffic initiated by the child rather than answering us.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A notification (no response expected).
    Notification(NotificationMessage),
    /// A request. It has already been answered.
    Request(RequestMessage),
}

/// Issues requests over a [`Transport`] and routes each response to its caller.
pub struct Correlator {
    transport: Arc<Transport>,
    next_id: AtomicI64,
    pending: PendingCalls,
    outbound: tokio::sync::Mutex<()>,
    inbound: std::sync::Mutex<Option<mpsc::Receiver<Inbound>>>,
    state: StateTracker,
    reader_handle: JoinHandle<()>,
}

impl Correlator {
    /// Starts the background reader. Must be called inside a tokio runtime.
    pub fn start(transport: Arc<Transport>, reader: LineReader, state: StateTracker) -> Self {
        let pending: PendingCalls = Arc::new(std::sync::Mutex::new(PendingTable::default()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let reader_handle = tokio::spawn(reader_task(
            transport.clone(),
            reader,
            pending.clone(),
            inbound_tx,
            state.clone(),
        ));

        Self {
            transport,
            next_id: AtomicI64::new(1),
            pending,
            outbound: tokio::sync::Mutex::new(()),
            inbound: std::sync::Mutex::new(Some(inbound_rx)),
            state,
            reader_handle,
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// `timeout` bounds the whole call: queueing behind other writers,
    /// writing the request, and waiting for the answer. A request that could
    /// not be written in time may have left a partial line on the pipe, so
    /// that also fails the session.
    ///
    /// Dropping the returned future releases the pending slot without
    /// touching other in-flight calls.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Protocol`] if the child answered with an error object.
    /// - [`BridgeError::Timeout`] if nothing arrived within `timeout`.
    /// - [`BridgeError::StreamEnded`] if the child closed its stdout.
    /// - [`BridgeError::Write`] if the request could not be written.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || BridgeError::Timeout {
            method: method.to_string(),
            timeout,
        };

        let (id, rx, _guard) = {
            // Ids go out on the wire in allocation order.
            let Ok(_order) = tokio::time::timeout_at(deadline, self.outbound.lock()).await else {
                warn!("Request {} timed out waiting for the pipe", method);
                return Err(timed_out());
            };
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();

            {
                let mut table = lock(&self.pending);
                if table.closed {
                    return Err(BridgeError::StreamEnded);
                }
                table.calls.insert(id, (method.to_string(), tx));
            }
            let guard = PendingGuard {
                pending: self.pending.clone(),
                id,
            };

            let request = RequestMessage::new(id, method, params);
            match tokio::time::timeout_at(deadline, self.transport.send_line(&request)).await {
                Ok(sent) => sent?,
                Err(_) => {
                    warn!(
                        "Request {} ({}) could not be written within {:?}",
                        id, method, timeout
                    );
                    self.state.fail("child stopped reading its input");
                    return Err(timed_out());
                }
            }
            (id, rx, guard)
        };

        debug!("Sent request {} ({})", id, method);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::StreamEnded),
            Err(_) => {
                warn!("Request {} ({}) timed out after {:?}", id, method, timeout);
                Err(timed_out())
            }
        }
    }

    /// Sends a notification. No response is expected.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Write`] if the pipe is closed.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BridgeError> {
        let _order = self.outbound.lock().await;
        self.transport
            .send_line(&NotificationMessage::new(method, params))
            .await
    }

    /// Takes the channel of child-initiated traffic. Returns `None` after the
    /// first call.
    ///
    /// Until it is taken, and whenever the taker falls behind, at most
    /// [`INBOUND_CAPACITY`] messages are kept.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).calls.len()
    }

    /// Returns true once the stream has ended or [`close`](Self::close) ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }

    /// Stops the reader and fails every outstanding call with
    /// [`BridgeError::StreamEnded`]. Returns how many calls were failed.
    pub fn close(&self) -> usize {
        self.reader_handle.abort();
        fail_pending(&self.pending)
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Removes the pending slot when a call is abandoned.
///
/// After a normal response the slot is already gone and this is a no-op.
struct PendingGuard {
    pending: PendingCalls,
    id: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).calls.remove(&self.id);
    }
}

/// Background task that reads child output and routes it.
async fn reader_task(
    transport: Arc<Transport>,
    mut reader: LineReader,
    pending: PendingCalls,
    inbound: mpsc::Sender<Inbound>,
    state: StateTracker,
) {
    loop {
        match reader.read_line().await {
            Ok(Some(Message::Response(response))) => dispatch_response(&pending, response),
            Ok(Some(Message::Notification(notification))) => {
                trace!("Child notification: {}", notification.method);
                publish(&inbound, Inbound::Notification(notification));
            }
            Ok(Some(Message::Request(request))) => {
                answer_child_request(&transport, &request);
                publish(&inbound, Inbound::Request(request));
            }
            Ok(None) => break,
            Err(e) => warn!("Skipping line: {}", e),
        }
    }

    // Fail the session first so callers woken below already see it.
    state.fail("child closed its output stream");
    let failed = fail_pending(&pending);
    debug!("Child reader exiting, {} pending call(s) failed", failed);
}

/// Hands a child message to the inbound channel without waiting.
fn publish(inbound: &mpsc::Sender<Inbound>, message: Inbound) {
    match inbound.try_send(message) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(message)) => {
            let method = match &message {
                Inbound::Notification(n) => &n.method,
                Inbound::Request(r) => &r.method,
            };
            warn!("Inbound queue full, dropping child message {}", method);
        }
    }
}

fn dispatch_response(pending: &PendingCalls, response: ResponseMessage) {
    let Some(RequestId::Number(id)) = response.id else {
        warn!("Dropping response with unusable id: {:?}", response.id);
        return;
    };

    let Some((method, slot)) = lock(pending).calls.remove(&id) else {
        warn!("Dropping response for unknown or abandoned request id {}", id);
        return;
    };

    let outcome = match response.error {
        Some(error) => Err(BridgeError::Protocol { method, error }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };

    if slot.send(outcome).is_err() {
        debug!("Caller for request {} went away", id);
    }
}

/// Replies to a child request without blocking the read loop.
///
/// `ping` gets an empty result; everything else is refused so the child
/// never waits on us.
fn answer_child_request(transport: &Arc<Transport>, request: &RequestMessage) {
    debug!("Child request: {} (id: {})", request.method, request.id);

    let response = if request.method == "ping" {
        ResponseMessage::success(request.id.clone(), serde_json::json!({}))
    } else {
        Ok(ResponseMessage::failure(
            Some(request.id.clone()),
            ResponseError::new(
                METHOD_NOT_FOUND,
                format!("Method '{}' not supported by client", request.method),
            ),
        ))
    };

    let Ok(response) = response else {
        return;
    };

    let transport = transport.clone();
    tokio::spawn(async move {
        if let Err(e) = transport.send_line(&response).await {
            warn!("Failed to answer child request: {}", e);
        }
    });
}

fn fail_pending(pending: &PendingCalls) -> usize {
    let calls = {
        let mut table = lock(pending);
        table.closed = true;
        std::mem::take(&mut table.calls)
    };

    let count = calls.len();
    for (_id, (_method, slot)) in calls {
        let _ = slot.send(Err(BridgeError::StreamEnded));
    }
    count
}
