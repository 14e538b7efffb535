// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Telegram channel adapter: long-poll transport, inbound normalisation,
//! outbound intent dispatch.
//!
//! # Polling
//!
//! One loop per connected instance issues `getUpdates` with
//! `offset = last_seen + 1` and the configured long-poll timeout.  Each
//! update passes the inbound filter chain, then the mapper; recoverable
//! transport/API errors emit a `channel_error` lifecycle event and back off
//! (1s initial, doubling, 60s cap).  `disconnect` aborts the in-flight
//! request and completes both event streams.
//!
//! # Ordering
//!
//! Outbound intents are serialised per destination ref, so intents for one
//! destination complete in submission order while distinct destinations
//! proceed concurrently.

pub mod api;
pub mod map;
pub mod markdown;
pub mod outbound;
pub mod refs;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tomte_bus::{Disposer, EventEmitter, EventStream};
use tracing::{debug, info, warn};

use crate::channel::{Channel, InboundHandler, LifecycleHandler, MediaStream};
use crate::error::ChannelError;
use crate::filter::{AllowedUsersFilter, FilterChain, UpdateContext};
use crate::model::{
    ChannelId, ChannelStatus, InboundEvent, IntentReceipt, LifecycleEvent, MediaReference,
    OutboundIntent,
};
use api::BotApi;
use outbound::TypingDebounce;

#[derive(Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub base_url: Option<String>,
    pub polling_timeout: Duration,
    pub allowed_updates: Option<Vec<String>>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: None,
            polling_timeout: Duration::from_secs(30),
            allowed_updates: None,
        }
    }
}

struct PollHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

pub struct TelegramChannel {
    id: ChannelId,
    config: TelegramConfig,
    api: Arc<BotApi>,
    filters: FilterChain,
    status: Arc<Mutex<ChannelStatus>>,
    inbound: Mutex<EventEmitter<InboundEvent>>,
    lifecycle: Mutex<EventEmitter<LifecycleEvent>>,
    debounce: TypingDebounce,
    poll: tokio::sync::Mutex<Option<PollHandle>>,
    /// Per-destination send serialisation.
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TelegramChannel {
    pub fn new(id: ChannelId, config: TelegramConfig, filters: FilterChain) -> Self {
        let api = Arc::new(BotApi::new(config.token.clone(), config.base_url.clone()));
        Self {
            id,
            config,
            api,
            filters,
            status: Arc::new(Mutex::new(ChannelStatus::Disconnected)),
            inbound: Mutex::new(EventEmitter::new()),
            lifecycle: Mutex::new(EventEmitter::new()),
            debounce: TypingDebounce::default(),
            poll: tokio::sync::Mutex::new(None),
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a channel from a daemon config entry.
    pub fn from_config(cfg: &tomte_config::ChannelConfig) -> Result<Self, ChannelError> {
        let token = cfg
            .resolve_token()
            .ok_or_else(|| ChannelError::InvalidState("telegram channel requires a token".into()))?;
        let id = cfg
            .id
            .clone()
            .map(ChannelId::from)
            .unwrap_or_else(ChannelId::generate);
        let config = TelegramConfig {
            token,
            base_url: cfg.base_url.clone(),
            polling_timeout: cfg.polling_timeout,
            allowed_updates: cfg.allowed_updates.clone(),
        };
        let filters =
            FilterChain::new().with(AllowedUsersFilter::new(cfg.allowed_users.iter().cloned()));
        Ok(Self::new(id, config, filters))
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn current_inbound(&self) -> EventEmitter<InboundEvent> {
        self.inbound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn current_lifecycle(&self) -> EventEmitter<LifecycleEvent> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

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

    fn send_lock(&self, dest_ref: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.send_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(dest_ref.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn adapter(&self) -> &'static str {
        "telegram"
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let mut poll = self.poll.lock().await;
        if poll.is_some() && self.status() == ChannelStatus::Connected {
            return Ok(());
        }

        self.set_status(ChannelStatus::Connecting);
        // Validate the token before starting the loop.
        let me = match self.api.get_me().await {
            Ok(me) => me,
            Err(e) => {
                self.set_status(ChannelStatus::Error);
                return Err(e);
            }
        };
        info!(channel = %self.id, bot_id = me.id, "telegram bot authenticated");

        self.refresh_emitters();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(PollContext {
            channel_id: self.id.clone(),
            api: self.api.clone(),
            inbound: self.current_inbound(),
            lifecycle: self.current_lifecycle(),
            filters: self.filters.clone(),
            status: self.status.clone(),
            timeout: self.config.polling_timeout,
            allowed_updates: self.config.allowed_updates.clone(),
            stop: stop_rx,
        }));
        *poll = Some(PollHandle { stop: stop_tx, task });

        self.set_status(ChannelStatus::Connected);
        self.current_lifecycle()
            .emit(LifecycleEvent::Connected {
                channel_id: self.id.clone(),
            })
            .await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        let handle = self.poll.lock().await.take();
        let Some(handle) = handle else {
            self.set_status(ChannelStatus::Disconnected);
            return Ok(());
        };

        // Cancels the in-flight getUpdates via the select in the loop.
        let _ = handle.stop.send(true);
        if tokio::time::timeout(Duration::from_secs(2), handle.task).await.is_err() {
            warn!(channel = %self.id, "polling loop did not stop in time");
        }

        self.current_lifecycle()
            .emit(LifecycleEvent::Disconnected {
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
        let lock = self.send_lock(&intent.destination().r#ref);
        let _guard = lock.lock().await;
        outbound::dispatch(&self.api, &self.debounce, &intent).await
    }

    async fn fetch_media(&self, reference: &MediaReference) -> Result<MediaStream, ChannelError> {
        let file = self.api.get_file(&reference.id).await?;
        let path = file
            .file_path
            .ok_or_else(|| ChannelError::Media("file path missing in getFile response".into()))?;
        let resp = self.api.download_file(&path).await?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| match chunk {
                Ok(bytes) => Ok(bytes.to_vec()),
                Err(e) => Err(ChannelError::Media(format!("download stream: {e}"))),
            });
        Ok(Box::pin(stream))
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

// ── Polling loop ──────────────────────────────────────────────────────────────

struct PollContext {
    channel_id: ChannelId,
    api: Arc<BotApi>,
    inbound: EventEmitter<InboundEvent>,
    lifecycle: EventEmitter<LifecycleEvent>,
    filters: FilterChain,
    status: Arc<Mutex<ChannelStatus>>,
    timeout: Duration,
    allowed_updates: Option<Vec<String>>,
    stop: watch::Receiver<bool>,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

async fn poll_loop(mut ctx: PollContext) {
    let mut offset: i64 = 0;
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;

    debug!(channel = %ctx.channel_id, "polling loop started");
    loop {
        if *ctx.stop.borrow() {
            break;
        }
        let poll = ctx
            .api
            .get_updates(offset + 1, ctx.timeout, ctx.allowed_updates.as_deref());
        tokio::select! {
            _ = ctx.stop.changed() => break,
            result = poll => match result {
                Ok(updates) => {
                    if attempt > 0 {
                        attempt = 0;
                        backoff = INITIAL_BACKOFF;
                        *ctx.status.lock().unwrap_or_else(|e| e.into_inner()) =
                            ChannelStatus::Connected;
                    }
                    for update in updates {
                        offset = offset.max(update.update_id);
                        let filter_ctx = UpdateContext {
                            author_id: map::author_id(&update),
                        };
                        if !ctx.filters.admit(&filter_ctx) {
                            debug!(channel = %ctx.channel_id, update_id = update.update_id,
                                   "update rejected by filter");
                            continue;
                        }
                        for event in map::map_update(&update, &ctx.channel_id) {
                            if matches!(event, InboundEvent::Unknown) {
                                warn!(channel = %ctx.channel_id, "unknown inbound event quarantined");
                                continue;
                            }
                            ctx.inbound.emit(event).await;
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    warn!(channel = %ctx.channel_id, error = %e, attempt, "polling error");
                    *ctx.status.lock().unwrap_or_else(|e| e.into_inner()) =
                        ChannelStatus::Reconnecting;
                    ctx.lifecycle
                        .emit(LifecycleEvent::ChannelError {
                            channel_id: ctx.channel_id.clone(),
                            error: e.to_string(),
                            recoverable: true,
                        })
                        .await;
                    ctx.lifecycle
                        .emit(LifecycleEvent::Reconnecting {
                            channel_id: ctx.channel_id.clone(),
                            attempt,
                        })
                        .await;
                    tokio::select! {
                        _ = ctx.stop.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
    debug!(channel = %ctx.channel_id, "polling loop stopped");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_requires_a_token() {
        let cfg = tomte_config::ChannelConfig {
            id: Some("tg".into()),
            adapter: "telegram".into(),
            token: None,
            token_env: None,
            base_url: None,
            polling_timeout: Duration::from_secs(30),
            allowed_updates: None,
            allowed_users: vec![],
            autoconnect: true,
        };
        assert!(TelegramChannel::from_config(&cfg).is_err());
    }

    #[test]
    fn from_config_builds_with_explicit_token() {
        let cfg = tomte_config::ChannelConfig {
            id: Some("tg".into()),
            adapter: "telegram".into(),
            token: Some("123:abc".into()),
            token_env: None,
            base_url: None,
            polling_timeout: Duration::from_secs(30),
            allowed_updates: None,
            allowed_users: vec!["42".into()],
            autoconnect: true,
        };
        let ch = TelegramChannel::from_config(&cfg).unwrap();
        assert_eq!(ch.id().as_str(), "tg");
        assert_eq!(ch.adapter(), "telegram");
        assert_eq!(ch.status(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_idempotent() {
        let ch = TelegramChannel::new(
            ChannelId::from("tg"),
            TelegramConfig {
                token: "123:abc".into(),
                ..Default::default()
            },
            FilterChain::new(),
        );
        ch.disconnect().await.unwrap();
        ch.disconnect().await.unwrap();
        assert_eq!(ch.status(), ChannelStatus::Disconnected);
    }
}
