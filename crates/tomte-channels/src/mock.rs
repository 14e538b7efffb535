// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! In-memory channel adapter for tests and local development.
//!
//! Records every processed intent with a timestamp, supports per-intent-type
//! synthetic failures and a per-call delay, and exposes `simulate_inbound` /
//! `simulate_lifecycle` entry points that bypass any network layer.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tomte_bus::{Disposer, EventEmitter, EventStream};

use crate::channel::{Channel, InboundHandler, LifecycleHandler, MediaStream};
use crate::error::ChannelError;
use crate::model::{
    ChannelId, ChannelStatus, InboundEvent, IntentReceipt, LifecycleEvent, MediaReference,
    OutboundIntent,
};

/// One recorded `process` call.
#[derive(Debug, Clone)]
pub struct ProcessedIntent {
    pub intent: OutboundIntent,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Behaviour {
    /// Intent types that fail with a simulated error.
    fail_types: HashSet<String>,
    delay: Option<Duration>,
}

pub struct MockChannel {
    id: ChannelId,
    status: Mutex<ChannelStatus>,
    inbound: Mutex<EventEmitter<InboundEvent>>,
    lifecycle: Mutex<EventEmitter<LifecycleEvent>>,
    processed: Mutex<Vec<ProcessedIntent>>,
    behaviour: Mutex<Behaviour>,
    media: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockChannel {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            status: Mutex::new(ChannelStatus::Disconnected),
            inbound: Mutex::new(EventEmitter::new()),
            lifecycle: Mutex::new(EventEmitter::new()),
            processed: Mutex::new(Vec::new()),
            behaviour: Mutex::new(Behaviour::default()),
            media: Mutex::new(HashMap::new()),
        }
    }

    /// All intents processed so far, in submission order.
    pub fn processed(&self) -> Vec<ProcessedIntent> {
        self.processed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make every intent of `intent_type` fail until cleared.
    pub fn fail_intent_type(&self, intent_type: &str, fail: bool) {
        let mut b = self.behaviour.lock().unwrap_or_else(|e| e.into_inner());
        if fail {
            b.fail_types.insert(intent_type.to_string());
        } else {
            b.fail_types.remove(intent_type);
        }
    }

    /// Delay applied to every `process` call.
    pub fn set_process_delay(&self, delay: Option<Duration>) {
        self.behaviour.lock().unwrap_or_else(|e| e.into_inner()).delay = delay;
    }

    /// Register bytes served by [`Channel::fetch_media`] for `reference.id`.
    pub fn put_media(&self, id: impl Into<String>, bytes: Vec<u8>) {
        self.media
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), bytes);
    }

    /// Inject an inbound event as if it came from the platform.
    pub async fn simulate_inbound(&self, event: InboundEvent) {
        let emitter = self.inbound.lock().unwrap_or_else(|e| e.into_inner()).clone();
        emitter.emit(event).await;
    }

    /// Inject a lifecycle event as if the transport produced it.
    pub async fn simulate_lifecycle(&self, event: LifecycleEvent) {
        let emitter = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).clone();
        emitter.emit(event).await;
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Replace a completed emitter pair so a reconnected instance has live
    /// streams again.
    fn refresh_emitters(&self) {
        let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        if inbound.is_completed() {
            *inbound = EventEmitter::new();
        }
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.is_completed() {
            *lifecycle = EventEmitter::new();
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn adapter(&self) -> &'static str {
        "mock"
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        if self.status() == ChannelStatus::Connected {
            return Ok(());
        }
        self.set_status(ChannelStatus::Connecting);
        self.refresh_emitters();
        self.set_status(ChannelStatus::Connected);
        self.simulate_lifecycle(LifecycleEvent::Connected {
            channel_id: self.id.clone(),
        })
        .await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        if self.status() == ChannelStatus::Disconnected {
            return Ok(());
        }
        self.simulate_lifecycle(LifecycleEvent::Disconnected {
            channel_id: self.id.clone(),
            reason: None,
        })
        .await;
        self.set_status(ChannelStatus::Disconnected);
        self.inbound.lock().unwrap_or_else(|e| e.into_inner()).complete();
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).complete();
        Ok(())
    }

    async fn process(&self, intent: OutboundIntent) -> Result<IntentReceipt, ChannelError> {
        let (delay, fails) = {
            let b = self.behaviour.lock().unwrap_or_else(|e| e.into_inner());
            (b.delay, b.fail_types.contains(intent.intent_type()))
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let intent_type = intent.intent_type();
        self.processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ProcessedIntent {
                intent: intent.clone(),
                at: Utc::now(),
            });

        if fails {
            return Err(ChannelError::Simulated(format!(
                "configured failure for {intent_type}"
            )));
        }
        Ok(IntentReceipt::ok(intent_type))
    }

    async fn fetch_media(&self, reference: &MediaReference) -> Result<MediaStream, ChannelError> {
        let bytes = self
            .media
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| ChannelError::Media(format!("no media for id {}", reference.id)))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
    }

    fn subscribe(&self, handler: InboundHandler) -> Disposer {
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on(move |ev| handler(ev))
    }

    fn events(&self) -> EventStream<InboundEvent> {
        self.inbound.lock().unwrap_or_else(|e| e.into_inner()).stream()
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) -> Disposer {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on(move |ev| handler(ev))
    }

    fn lifecycle(&self) -> EventStream<LifecycleEvent> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).stream()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::model::{ConversationType, Destination, DestinationMeta, OutboundContent};

    fn dest(id: &ChannelId) -> Destination {
        Destination {
            channel_id: id.clone(),
            r#ref: "1::".to_string(),
            metadata: DestinationMeta {
                conversation_type: ConversationType::Direct,
                title: None,
                participant_count: None,
                platform_data: serde_json::Map::new(),
            },
        }
    }

    fn responding(id: &ChannelId, text: &str) -> OutboundIntent {
        OutboundIntent::AgentResponding {
            destination: dest(id),
            content: OutboundContent::Text {
                text: text.into(),
                formatting_hint: None,
            },
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn records_processed_intents_in_order() {
        let ch = MockChannel::new(ChannelId::from("m"));
        ch.process(responding(ch.id(), "one")).await.unwrap();
        ch.process(responding(ch.id(), "two")).await.unwrap();

        let recorded = ch.processed();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].at <= recorded[1].at);
    }

    #[tokio::test]
    async fn duplicated_responding_is_recorded_twice() {
        // agent_responding is not idempotent: two dispatches, two sends.
        let ch = MockChannel::new(ChannelId::from("m"));
        let intent = responding(ch.id(), "same");
        ch.process(intent.clone()).await.unwrap();
        ch.process(intent).await.unwrap();
        assert_eq!(ch.processed().len(), 2);
    }

    #[tokio::test]
    async fn configured_failure_fails_only_that_type() {
        let ch = MockChannel::new(ChannelId::from("m"));
        ch.fail_intent_type("agent_responding", true);

        let err = ch.process(responding(ch.id(), "x")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Simulated(_)));

        let thinking = OutboundIntent::AgentThinking {
            destination: dest(ch.id()),
            timestamp: 0,
        };
        assert!(ch.process(thinking).await.is_ok());
    }

    #[tokio::test]
    async fn connect_is_idempotent_when_connected() {
        let ch = MockChannel::new(ChannelId::from("m"));
        ch.connect().await.unwrap();
        let mut lifecycle = ch.lifecycle();
        // A second connect must not emit another Connected event.
        ch.connect().await.unwrap();
        ch.simulate_lifecycle(LifecycleEvent::Reconnecting {
            channel_id: ch.id().clone(),
            attempt: 1,
        })
        .await;
        let ev = lifecycle.next().await.unwrap();
        assert!(matches!(ev, LifecycleEvent::Reconnecting { .. }));
    }

    #[tokio::test]
    async fn disconnect_completes_streams() {
        let ch = MockChannel::new(ChannelId::from("m"));
        ch.connect().await.unwrap();
        let mut events = ch.events();
        ch.disconnect().await.unwrap();
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn fetch_media_serves_registered_bytes() {
        let ch = MockChannel::new(ChannelId::from("m"));
        ch.put_media("file-1", vec![1, 2, 3]);
        let mut stream = ch
            .fetch_media(&MediaReference {
                platform: "mock".into(),
                id: "file-1".into(),
            })
            .await
            .unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fetch_media_unknown_id_is_an_error() {
        let ch = MockChannel::new(ChannelId::from("m"));
        let res = ch
            .fetch_media(&MediaReference {
                platform: "mock".into(),
                id: "missing".into(),
            })
            .await;
        assert!(res.is_err());
    }
}
