// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Typed in-process event fan-out.
//!
//! [`EventEmitter`] is the primitive underneath channel inbound streams,
//! session event streams, and subscription delivery.  It offers two
//! consumption styles:
//!
//! - **Handlers** — [`EventEmitter::on`] / [`EventEmitter::once`] register a
//!   callback invoked inline during [`EventEmitter::emit`], in registration
//!   order.  A handler returning an error is logged and the remaining
//!   handlers still run.
//! - **Streams** — [`EventEmitter::stream`] returns an async sequence.
//!   Values produced between two awaits are buffered in a bounded ring;
//!   overflow either drops the oldest value or suspends the producer,
//!   depending on the stream's [`OverflowPolicy`].
//!
//! [`EventEmitter::complete`] marks the emitter terminal: handlers registered
//! afterwards never fire and every stream consumer observes end-of-sequence
//! once the buffered values are drained.
//!
//! Handlers are never invoked while the subscriber list lock is held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tracing::warn;

/// Default ring capacity for [`EventEmitter::stream`].
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// What to do when a stream's ring buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest buffered value to make room.
    DropOldest,
    /// Suspend the emitting task until the consumer drains a value.
    Block,
}

type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

struct HandlerEntry<T> {
    id: u64,
    /// Set once a `once` handler has fired; the entry is removed right after.
    fired: Arc<AtomicBool>,
    once: bool,
    f: Handler<T>,
}

struct State<T> {
    next_id: u64,
    handlers: Vec<HandlerEntry<T>>,
    streams: Vec<Arc<StreamBuf<T>>>,
    completed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// Multi-consumer event emitter.  Cheap to clone; clones share subscribers.
pub struct EventEmitter<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_id: 0,
                    handlers: Vec::new(),
                    streams: Vec::new(),
                    completed: false,
                }),
            }),
        }
    }

    /// Register a handler.  Returns a disposer that unregisters it.
    ///
    /// After [`complete`](Self::complete) the handler is never registered and
    /// the returned disposer is inert.
    pub fn on(
        &self,
        handler: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Disposer {
        self.register(handler, false)
    }

    /// Register a handler that auto-disposes after its first delivery.
    pub fn once(
        &self,
        handler: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Disposer {
        self.register(handler, true)
    }

    fn register(
        &self,
        handler: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
        once: bool,
    ) -> Disposer {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.completed {
            return Disposer::inert();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.handlers.push(HandlerEntry {
            id,
            fired: Arc::new(AtomicBool::new(false)),
            once,
            f: Arc::new(handler),
        });
        drop(state);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Disposer::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.handlers.retain(|h| h.id != id);
            }
        })
    }

    /// Open an async consumer with the default capacity and drop-oldest
    /// overflow.
    pub fn stream(&self) -> EventStream<T> {
        self.stream_with(DEFAULT_STREAM_CAPACITY, OverflowPolicy::DropOldest)
    }

    /// Open an async consumer with explicit capacity and overflow policy.
    pub fn stream_with(&self, capacity: usize, policy: OverflowPolicy) -> EventStream<T> {
        let buf = Arc::new(StreamBuf::new(capacity.max(1), policy));
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.completed {
            buf.close();
        } else {
            state.streams.push(buf.clone());
        }
        EventStream { buf }
    }

    /// Deliver `ev` to every live handler (in registration order), then to
    /// every stream.  Suspends only when a [`OverflowPolicy::Block`] stream
    /// is full.
    pub async fn emit(&self, ev: T) {
        let (handlers, streams) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.completed {
                return;
            }
            // Drop closed streams (consumer went away) while we are here.
            state.streams.retain(|s| !s.is_closed());
            let handlers: Vec<(Arc<AtomicBool>, bool, Handler<T>)> = state
                .handlers
                .iter()
                .map(|h| (h.fired.clone(), h.once, h.f.clone()))
                .collect();
            let streams: Vec<Arc<StreamBuf<T>>> = state.streams.clone();
            (handlers, streams)
        };

        let mut fired_once = false;
        for (fired, once, f) in &handlers {
            if *once && fired.swap(true, Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = f(&ev) {
                warn!(error = %e, "event handler failed");
            }
            fired_once |= *once;
        }
        if fired_once {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .handlers
                .retain(|h| !(h.once && h.fired.load(Ordering::SeqCst)));
        }

        for s in streams {
            s.push(ev.clone()).await;
        }
    }

    /// Mark the emitter terminal.  Buffered stream values remain readable;
    /// after draining, consumers observe end-of-sequence.  Idempotent.
    pub fn complete(&self) {
        let streams = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.completed = true;
            state.handlers.clear();
            std::mem::take(&mut state.streams)
        };
        for s in streams {
            s.close();
        }
    }

    /// True once [`complete`](Self::complete) has been called.
    pub fn is_completed(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed
    }
}

/// Unregisters a handler when explicitly disposed.  Dropping the disposer
/// without calling [`Disposer::dispose`] leaves the handler registered.
pub struct Disposer {
    f: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { f: Some(Box::new(f)) }
    }

    fn inert() -> Self {
        Self { f: None }
    }

    pub fn dispose(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

// ── Stream buffer ─────────────────────────────────────────────────────────────

struct StreamBuf<T> {
    capacity: usize,
    policy: OverflowPolicy,
    q: Mutex<VecDeque<T>>,
    closed: AtomicBool,
    data: Notify,
    space: Notify,
}

impl<T> StreamBuf<T> {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            policy,
            q: Mutex::new(VecDeque::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            data: Notify::new(),
            space: Notify::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.data.notify_waiters();
        self.space.notify_waiters();
    }

    async fn push(&self, v: T) {
        loop {
            // Create the wait future before checking the condition so a
            // notify between check and await is not lost.
            let wait = self.space.notified();
            {
                let mut q = self.q.lock().unwrap_or_else(|e| e.into_inner());
                if self.is_closed() {
                    return;
                }
                if q.len() < self.capacity {
                    q.push_back(v);
                    self.data.notify_one();
                    return;
                }
                if self.policy == OverflowPolicy::DropOldest {
                    q.pop_front();
                    q.push_back(v);
                    self.data.notify_one();
                    return;
                }
            }
            wait.await;
        }
    }

    async fn pop(&self) -> Option<T> {
        loop {
            let wait = self.data.notified();
            {
                let mut q = self.q.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = q.pop_front() {
                    self.space.notify_one();
                    return Some(v);
                }
                if self.is_closed() {
                    return None;
                }
            }
            wait.await;
        }
    }
}

/// Async consumer side of an emitter.  `None` from [`EventStream::next`]
/// means the emitter completed and the buffer is drained.
pub struct EventStream<T> {
    buf: Arc<StreamBuf<T>>,
}

impl<T> EventStream<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.buf.pop().await
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        // Unblock any producer waiting on this buffer; emit() prunes the
        // entry on its next pass.
        self.buf.close();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        let _a = bus.on(move |_| {
            o1.lock().unwrap().push("first");
            Ok(())
        });
        let o2 = order.clone();
        let _b = bus.on(move |_| {
            o2.lock().unwrap().push("second");
            Ok(())
        });

        bus.emit(1).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_rest() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _a = bus.on(|_| Err(anyhow::anyhow!("boom")));
        let h = hits.clone();
        let _b = bus.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(1).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_fires_exactly_once() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _d = bus.once(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(1).await;
        bus.emit(2).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disposed_handler_no_longer_fires() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let d = bus.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(1).await;
        d.dispose();
        bus.emit(2).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_buffers_values_between_awaits() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let mut s = bus.stream();

        bus.emit(1).await;
        bus.emit(2).await;
        bus.emit(3).await;

        assert_eq!(s.next().await, Some(1));
        assert_eq!(s.next().await, Some(2));
        assert_eq!(s.next().await, Some(3));
    }

    #[tokio::test]
    async fn drop_oldest_discards_the_head_on_overflow() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let mut s = bus.stream_with(2, OverflowPolicy::DropOldest);

        bus.emit(1).await;
        bus.emit(2).await;
        bus.emit(3).await; // 1 is dropped

        assert_eq!(s.next().await, Some(2));
        assert_eq!(s.next().await, Some(3));
    }

    #[tokio::test]
    async fn block_policy_suspends_the_producer_until_drained() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let mut s = bus.stream_with(1, OverflowPolicy::Block);

        bus.emit(1).await;

        // Second emit must not complete until the consumer drains.
        let bus2 = bus.clone();
        let emit2 = tokio::spawn(async move { bus2.emit(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!emit2.is_finished(), "producer should be blocked");

        assert_eq!(s.next().await, Some(1));
        tokio::time::timeout(Duration::from_millis(500), emit2)
            .await
            .expect("producer should unblock")
            .unwrap();
        assert_eq!(s.next().await, Some(2));
    }

    #[tokio::test]
    async fn complete_ends_streams_after_drain() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let mut s = bus.stream();

        bus.emit(7).await;
        bus.complete();

        assert_eq!(s.next().await, Some(7));
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn on_after_complete_never_receives() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        bus.complete();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _d = bus.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(1).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emit_after_complete_is_a_no_op() {
        let bus: EventEmitter<u32> = EventEmitter::new();
        let mut s = bus.stream();
        bus.complete();
        bus.emit(1).await;
        assert_eq!(s.next().await, None);
    }
}
