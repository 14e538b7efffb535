// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! One accepted control client.
//!
//! Each connection runs a reader and a writer task.  Responses travel on an
//! unbounded control channel (a response is never dropped); notifications
//! travel through a bounded outbox whose overflow policy depends on the
//! stream: drop-oldest for `logs`/`events.*`, block-the-producer for
//! `agent.output`.
//!
//! On close, pending requests die with the connection (the client observes
//! NOT_CONNECTED locally) and every subscription is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::framing::{read_frame, write_frame};
use crate::protocol::{classify, Envelope, Frame};
use crate::service::DaemonService;
use crate::subscription::SubscriptionSet;

// ── Outbox ────────────────────────────────────────────────────────────────────

/// Bounded notification queue with both overflow policies.
pub struct Outbox {
    capacity: usize,
    q: Mutex<VecDeque<Envelope>>,
    closed: AtomicBool,
    data: Notify,
    space: Notify,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            q: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            data: Notify::new(),
            space: Notify::new(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.data.notify_waiters();
        self.space.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop-oldest enqueue for `logs` and `events.*` notifications.
    pub fn push_dropping(&self, envelope: Envelope) {
        let mut q = self.q.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return;
        }
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(envelope);
        self.data.notify_one();
    }

    /// Blocking enqueue for `agent.output` notifications: the producer
    /// waits for space instead of losing output.
    pub async fn push_blocking(&self, envelope: Envelope) {
        let mut envelope = Some(envelope);
        loop {
            let wait = self.space.notified();
            {
                let mut q = self.q.lock().unwrap_or_else(|e| e.into_inner());
                if self.is_closed() {
                    return;
                }
                if q.len() < self.capacity {
                    q.push_back(envelope.take().unwrap());
                    self.data.notify_one();
                    return;
                }
            }
            wait.await;
        }
    }

    async fn pop(&self) -> Option<Envelope> {
        loop {
            let wait = self.data.notified();
            {
                let mut q = self.q.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(envelope) = q.pop_front() {
                    self.space.notify_one();
                    return Some(envelope);
                }
                if self.is_closed() {
                    return None;
                }
            }
            wait.await;
        }
    }
}

// ── Connection handle ─────────────────────────────────────────────────────────

/// Shared view of one client connection, held by the service's dispatcher
/// tasks for notification delivery.
pub struct ConnectionHandle {
    pub id: u64,
    pub subscriptions: SubscriptionSet,
    outbox: Outbox,
    control_tx: mpsc::UnboundedSender<Envelope>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: u64,
        outbox_capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            subscriptions: SubscriptionSet::new(),
            outbox: Outbox::new(outbox_capacity),
            control_tx,
            closed: AtomicBool::new(false),
        });
        (handle, control_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a response.  Responses bypass the bounded outbox.
    pub fn respond(&self, envelope: Envelope) {
        if self.control_tx.send(envelope).is_err() {
            debug!(conn = self.id, "response dropped: connection writer gone");
        }
    }

    pub fn notify_dropping(&self, method: &str, params: serde_json::Value) {
        self.outbox.push_dropping(Envelope::notification(method, params));
    }

    pub async fn notify_blocking(&self, method: &str, params: serde_json::Value) {
        self.outbox
            .push_blocking(Envelope::notification(method, params))
            .await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbox.close();
        self.subscriptions.clear();
    }
}

// ── Serve loop ────────────────────────────────────────────────────────────────

/// Drive one accepted client until EOF or I/O error.
pub async fn serve(stream: UnixStream, id: u64, service: Arc<DaemonService>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (handle, mut control_rx) = ConnectionHandle::new(id, service.outbox_capacity());
    service.register_connection(handle.clone());
    debug!(conn = id, "client connected");

    // Writer: responses first (biased), then buffered notifications.
    let writer_handle = handle.clone();
    let writer = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                biased;
                maybe = control_rx.recv() => maybe,
                maybe = writer_handle.outbox.pop() => maybe,
            };
            let Some(envelope) = envelope else { break };
            if let Err(e) = write_frame(&mut write_half, &envelope).await {
                debug!(conn = id, error = %e, "write failed, closing");
                break;
            }
        }
    });

    // Reader: classify frames and dispatch requests.
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(envelope)) => match classify(envelope) {
                Some(Frame::Request { id: req_id, method, params }) => {
                    service.handle_request(handle.clone(), req_id, method, params);
                }
                Some(Frame::Notification { method, .. }) => {
                    debug!(conn = id, method, "client notification ignored");
                }
                Some(Frame::Response { id: resp_id, .. }) => {
                    // The daemon issues no requests; orphan responses are
                    // ignored by contract.
                    debug!(conn = id, resp_id, "orphan response ignored");
                }
                None => warn!(conn = id, "frame with neither id nor method discarded"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(conn = id, error = %e, "read failed, closing");
                break;
            }
        }
    }

    service.remove_connection(id);
    handle.close();
    writer.abort();
    debug!(conn = id, "client disconnected");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
