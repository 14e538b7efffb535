// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tomte_bus::{Disposer, EventStream};

use crate::error::ChannelError;
use crate::model::{
    ChannelId, ChannelStatus, InboundEvent, IntentReceipt, LifecycleEvent, MediaReference,
    OutboundIntent,
};

/// Chunked media download.
pub type MediaStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChannelError>> + Send>>;

pub type InboundHandler = Box<dyn Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync>;
pub type LifecycleHandler = Box<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// Uniform contract every platform adapter implements.
///
/// Lifecycle: `disconnected → connecting → connected → {reconnecting, error}
/// → disconnected`.  `connect` is idempotent while connected; `disconnect`
/// completes the inbound and lifecycle streams so consumers observe
/// end-of-sequence.  At most one polling loop exists per instance.
///
/// `process` is idempotent only for informational intents
/// ([`OutboundIntent::is_informational`]); dispatching `agent_responding` or
/// `agent_error` twice sends two messages.  For a given destination, intents
/// complete in submission order; across destinations no order is guaranteed.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &ChannelId;

    /// Adapter name ("telegram", "mock").
    fn adapter(&self) -> &'static str;

    fn status(&self) -> ChannelStatus;

    async fn connect(&self) -> Result<(), ChannelError>;

    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Translate one canonical intent into platform API calls.
    async fn process(&self, intent: OutboundIntent) -> Result<IntentReceipt, ChannelError>;

    /// Resolve an opaque media reference produced by this adapter into a
    /// byte stream.
    async fn fetch_media(&self, reference: &MediaReference) -> Result<MediaStream, ChannelError>;

    /// Register an inbound event handler.
    fn subscribe(&self, handler: InboundHandler) -> Disposer;

    /// Async sequence of inbound events.  Ends at `disconnect`.
    fn events(&self) -> EventStream<InboundEvent>;

    /// Register a lifecycle handler.
    fn on_lifecycle(&self, handler: LifecycleHandler) -> Disposer;

    /// Async sequence of lifecycle events.  Ends at `disconnect`.
    fn lifecycle(&self) -> EventStream<LifecycleEvent>;
}
