// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Aggregation point for all live channel instances.
//!
//! The registry exclusively owns its channels.  Inbound events from every
//! registered channel are forwarded into one aggregate stream, tagged with
//! the channel id, so a single consumer (the daemon) observes all platforms
//! uniformly.  Outbound intents are routed back by channel id.
//!
//! Lock discipline: the channel map lock is held only for map access — the
//! channel is cloned out before any adapter I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tomte_bus::{Disposer, EventEmitter, EventStream};
use tracing::debug;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::model::{ChannelId, InboundEvent, IntentReceipt, LifecycleEvent, OutboundIntent};

/// An inbound event tagged with its source channel.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub channel_id: ChannelId,
    pub event: InboundEvent,
}

struct Entry {
    channel: Arc<dyn Channel>,
    /// Forwards the channel's inbound stream into the aggregate emitter.
    inbound_task: tokio::task::JoinHandle<()>,
    lifecycle_task: tokio::task::JoinHandle<()>,
}

pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, Entry>>,
    aggregate: EventEmitter<TaggedEvent>,
    lifecycle: EventEmitter<LifecycleEvent>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            aggregate: EventEmitter::new(),
            lifecycle: EventEmitter::new(),
        }
    }

    /// Register a channel and begin forwarding its streams.
    ///
    /// Fails with [`ChannelError::Duplicate`] when the id is already
    /// registered.
    pub fn register(&self, channel: Arc<dyn Channel>) -> Result<(), ChannelError> {
        let id = channel.id().clone();
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&id) {
            return Err(ChannelError::Duplicate(id));
        }

        let inbound_task = {
            let mut events = channel.events();
            let aggregate = self.aggregate.clone();
            let channel_id = id.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    aggregate
                        .emit(TaggedEvent {
                            channel_id: channel_id.clone(),
                            event,
                        })
                        .await;
                }
            })
        };

        let lifecycle_task = {
            let mut events = channel.lifecycle();
            let lifecycle = self.lifecycle.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    lifecycle.emit(event).await;
                }
            })
        };

        debug!(channel = %id, adapter = channel.adapter(), "channel registered");
        map.insert(
            id,
            Entry {
                channel,
                inbound_task,
                lifecycle_task,
            },
        );
        Ok(())
    }

    /// Remove a channel and dispose its inbound subscription.
    pub fn unregister(&self, id: &ChannelId) -> Result<Arc<dyn Channel>, ChannelError> {
        let entry = {
            let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(id).ok_or_else(|| ChannelError::NotFound(id.clone()))?
        };
        entry.inbound_task.abort();
        entry.lifecycle_task.abort();
        debug!(channel = %id, "channel unregistered");
        Ok(entry.channel)
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<dyn Channel>> {
        let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.get(id).map(|e| e.channel.clone())
    }

    /// All registered channels, sorted by id for stable listings.
    pub fn list(&self) -> Vec<Arc<dyn Channel>> {
        let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut channels: Vec<_> = map.values().map(|e| e.channel.clone()).collect();
        channels.sort_by(|a, b| a.id().as_str().cmp(b.id().as_str()));
        channels
    }

    /// Async sequence of `{channel_id, event}` for every registered channel.
    pub fn subscribe(&self) -> EventStream<TaggedEvent> {
        self.aggregate.stream()
    }

    /// Register a handler on the aggregate stream.
    pub fn on_event(
        &self,
        handler: impl Fn(&TaggedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Disposer {
        self.aggregate.on(handler)
    }

    /// Aggregated lifecycle events from every registered channel.
    pub fn lifecycle(&self) -> EventStream<LifecycleEvent> {
        self.lifecycle.stream()
    }

    /// Route an intent to the channel that owns `id`.
    ///
    /// The map lock is released before the adapter call.
    pub async fn process(
        &self,
        id: &ChannelId,
        intent: OutboundIntent,
    ) -> Result<IntentReceipt, ChannelError> {
        let channel = self
            .get(id)
            .ok_or_else(|| ChannelError::NotFound(id.clone()))?;
        channel.process(intent).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockChannel;
    use crate::model::{
        Author, ConversationType, Destination, DestinationMeta, InboundContent, OutboundContent,
    };

    fn dest(channel_id: &ChannelId) -> Destination {
        Destination {
            channel_id: channel_id.clone(),
            r#ref: "1::".to_string(),
            metadata: DestinationMeta {
                conversation_type: ConversationType::Direct,
                title: None,
                participant_count: None,
                platform_data: serde_json::Map::new(),
            },
        }
    }

    fn message(channel_id: &ChannelId) -> InboundEvent {
        InboundEvent::MessageReceived {
            origin: dest(channel_id),
            author: Author::unknown(),
            content: InboundContent::Text { text: "hi".into() },
            message_id: "1".into(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = ChannelRegistry::new();
        let a = Arc::new(MockChannel::new(ChannelId::from("dup")));
        let b = Arc::new(MockChannel::new(ChannelId::from("dup")));

        registry.register(a).unwrap();
        let err = registry.register(b).unwrap_err();
        assert!(matches!(err, ChannelError::Duplicate(_)));
    }

    #[tokio::test]
    async fn aggregate_stream_tags_events_with_channel_id() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::from("mock-1");
        let channel = Arc::new(MockChannel::new(id.clone()));
        channel.connect().await.unwrap();
        registry.register(channel.clone()).unwrap();

        let mut agg = registry.subscribe();
        channel.simulate_inbound(message(&id)).await;

        let tagged = tokio::time::timeout(Duration::from_millis(500), agg.next())
            .await
            .expect("no aggregate event")
            .unwrap();
        assert_eq!(tagged.channel_id, id);
        assert_eq!(tagged.event.event_type(), "message_received");
    }

    #[tokio::test]
    async fn process_routes_by_channel_id() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::from("mock-2");
        let channel = Arc::new(MockChannel::new(id.clone()));
        registry.register(channel.clone()).unwrap();

        let intent = OutboundIntent::AgentResponding {
            destination: dest(&id),
            content: OutboundContent::Text {
                text: "hello".into(),
                formatting_hint: None,
            },
            timestamp: 0,
        };
        let receipt = registry.process(&id, intent).await.unwrap();
        assert!(receipt.success);
        assert_eq!(channel.processed().len(), 1);
    }

    #[tokio::test]
    async fn process_unknown_channel_fails() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::from("ghost");
        let intent = OutboundIntent::AgentThinking {
            destination: dest(&id),
            timestamp: 0,
        };
        let err = registry.process(&id, intent).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotFound(_)));
    }

    #[tokio::test]
    async fn unregister_stops_forwarding() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::from("mock-3");
        let channel = Arc::new(MockChannel::new(id.clone()));
        channel.connect().await.unwrap();
        registry.register(channel.clone()).unwrap();

        let mut agg = registry.subscribe();
        registry.unregister(&id).unwrap();
        // Give the aborted task a moment to die.
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.simulate_inbound(message(&id)).await;
        let res = tokio::time::timeout(Duration::from_millis(100), agg.next()).await;
        assert!(res.is_err(), "no event should be forwarded after unregister");
    }
}
