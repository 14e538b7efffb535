// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `DaemonService` — the hub behind the RPC router.
//!
//! # Design
//!
//! ```text
//!   client conn ──► handle_request ──► dispatch ──► domain op
//!        ▲                                             │
//!        │        notification pumps (logs, channel     │
//!        └──────  events, lifecycle, agent output) ◄────┘
//!
//!   channel poller ──► registry aggregate ──► route_inbound ──► session
//!   session events ──► bridge task ──► agent.output subs + outbound intents
//! ```
//!
//! Lock discipline: the session map, connection map, checkpoint store, and
//! conversation store each have their own mutex; everything is cloned out
//! of a map before any adapter I/O or `.await`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::watch;
use tomte_agent::{
    AgentAdapter, AgentError, AgentSession, Checkpoint, InjectorPipeline, MockAdapter,
    SessionConfig, SessionEvent, SessionId, SessionStatus, ToolRegistry,
};
use tomte_bus::OverflowPolicy;
use tomte_channels::{
    Channel, ChannelId, ChannelRegistry, ConversationType, Destination, DestinationMeta,
    FormattingHint, InboundContent, InboundEvent, MockChannel, OutboundContent, OutboundIntent,
    TaggedEvent, TelegramChannel,
};
use tomte_config::{AgentDefaults, ChannelConfig, Config};
use tomte_scheduler::Scheduler;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandle;
use crate::conversations::{conversation_key, ConversationStore};
use crate::error::DaemonError;
use crate::logbuf::{LogBuffer, LogFilter};
use crate::protocol::{codes, Envelope, RpcError};
use crate::subscription::{AgentOutputFilter, SubscriptionType};

pub type AdapterFactory =
    Arc<dyn Fn(&AgentDefaults, Option<&str>) -> Arc<dyn AgentAdapter> + Send + Sync>;
pub type ChannelFactory =
    Arc<dyn Fn(&ChannelConfig) -> Result<Arc<dyn Channel>, tomte_channels::ChannelError> + Send + Sync>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

struct SessionEntry {
    session: Arc<AgentSession>,
    run_task: tokio::task::JoinHandle<()>,
    bridge_task: tokio::task::JoinHandle<()>,
}

pub struct DaemonService {
    started_at: chrono::DateTime<Utc>,
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    pub registry: Arc<ChannelRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub conversations: ConversationStore,
    pub log_buffer: Arc<LogBuffer>,
    tools: Arc<ToolRegistry>,

    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    checkpoints: Mutex<HashMap<SessionId, Vec<Checkpoint>>>,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    next_conn_id: AtomicU64,

    adapters: Mutex<HashMap<String, AdapterFactory>>,
    channel_factories: Mutex<HashMap<String, ChannelFactory>>,

    accepting: AtomicBool,
    in_flight: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonService {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        log_buffer: Arc<LogBuffer>,
        tools: ToolRegistry,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        let mut adapters: HashMap<String, AdapterFactory> = HashMap::new();
        adapters.insert(
            "mock".to_string(),
            Arc::new(|_defaults, _model| Arc::new(MockAdapter::new()) as Arc<dyn AgentAdapter>),
        );

        let mut channel_factories: HashMap<String, ChannelFactory> = HashMap::new();
        channel_factories.insert(
            "telegram".to_string(),
            Arc::new(|cfg| {
                TelegramChannel::from_config(cfg).map(|ch| Arc::new(ch) as Arc<dyn Channel>)
            }),
        );
        channel_factories.insert(
            "mock".to_string(),
            Arc::new(|cfg| {
                let id = cfg
                    .id
                    .clone()
                    .map(ChannelId::from)
                    .unwrap_or_else(ChannelId::generate);
                Ok(Arc::new(MockChannel::new(id)) as Arc<dyn Channel>)
            }),
        );

        Arc::new(Self {
            started_at: Utc::now(),
            config: RwLock::new(config),
            config_path,
            registry: Arc::new(ChannelRegistry::new()),
            scheduler: Arc::new(Scheduler::new()),
            conversations: ConversationStore::new(),
            log_buffer,
            tools: Arc::new(tools),
            sessions: Mutex::new(HashMap::new()),
            checkpoints: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            adapters: Mutex::new(adapters),
            channel_factories: Mutex::new(channel_factories),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            shutdown_tx,
        })
    }

    /// Register a named agent adapter factory (`agent.spawn {adapter}`).
    pub fn register_adapter(&self, name: &str, factory: AdapterFactory) {
        self.adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), factory);
    }

    /// Register a channel adapter factory used for config-driven channels.
    pub fn register_channel_factory(&self, name: &str, factory: ChannelFactory) {
        self.channel_factories
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), factory);
    }

    pub fn outbox_capacity(&self) -> usize {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .daemon
            .outbox_capacity
    }

    fn request_timeout(&self) -> Duration {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .daemon
            .request_timeout
    }

    fn agent_defaults(&self) -> AgentDefaults {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .agent
            .clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Build channels from config, register scheduler jobs, and spawn the
    /// notification pumps.  Called once before serving.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner()).clone();

        for channel_config in &config.channels {
            let factory = {
                let factories = self
                    .channel_factories
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                factories.get(&channel_config.adapter).cloned()
            }
            .ok_or_else(|| {
                anyhow::anyhow!("unknown channel adapter \"{}\"", channel_config.adapter)
            })?;
            let channel = factory(channel_config)?;
            let id = channel.id().clone();
            self.registry.register(channel.clone())?;
            if channel_config.autoconnect {
                if let Err(e) = channel.connect().await {
                    // Recoverable: the channel can be connected later over RPC.
                    warn!(channel = %id, error = %e, "channel connect failed at startup");
                }
            }
        }

        self.register_jobs(&config)?;
        self.spawn_pumps();
        tokio::spawn(self.scheduler.clone().run(self.shutdown_signal()));
        info!(version = VERSION, "daemon service started");
        Ok(())
    }

    fn register_jobs(self: &Arc<Self>, config: &Config) -> anyhow::Result<()> {
        for job in &config.scheduler.jobs {
            let service = Arc::downgrade(self);
            let name = job.name.clone();
            let task = job.task.clone();
            self.scheduler.register(
                &job.name,
                &job.schedule,
                job.enabled,
                Arc::new(move || {
                    let service = service.clone();
                    let name = name.clone();
                    let task = task.clone();
                    Box::pin(async move {
                        if let Some(service) = service.upgrade() {
                            service.spawn_pulse(&name, &task);
                        }
                    })
                }),
            )?;
        }
        Ok(())
    }

    /// Spawn the log, channel-event, and lifecycle pumps.
    fn spawn_pumps(self: &Arc<Self>) {
        // Logs: broadcast → matching subscriptions, drop-oldest.
        {
            let service = self.clone();
            let mut rx = self.log_buffer.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(record) => {
                            for conn in service.connections_snapshot() {
                                for sub in conn.subscriptions.matching(SubscriptionType::Logs) {
                                    if sub.log_filter.matches(&record) {
                                        conn.notify_dropping(
                                            "log",
                                            json!({
                                                "subscription_id": sub.id,
                                                "record": record,
                                            }),
                                        );
                                    }
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        // Channel events: aggregate stream → subscriptions + inbound routing.
        {
            let service = self.clone();
            let mut stream = self.registry.subscribe();
            tokio::spawn(async move {
                while let Some(tagged) = stream.next().await {
                    for conn in service.connections_snapshot() {
                        for sub in conn
                            .subscriptions
                            .matching(SubscriptionType::ChannelEvents)
                        {
                            conn.notify_dropping(
                                "event.channel",
                                json!({
                                    "subscription_id": sub.id,
                                    "channel_id": tagged.channel_id,
                                    "event": tagged.event,
                                }),
                            );
                        }
                    }
                    service.route_inbound(&tagged).await;
                }
            });
        }

        // Lifecycle events.
        {
            let service = self.clone();
            let mut stream = self.registry.lifecycle();
            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    for conn in service.connections_snapshot() {
                        for sub in conn
                            .subscriptions
                            .matching(SubscriptionType::LifecycleEvents)
                        {
                            conn.notify_dropping(
                                "event.lifecycle",
                                json!({
                                    "subscription_id": sub.id,
                                    "event": event,
                                }),
                            );
                        }
                    }
                }
            });
        }
    }

    // ── Connection bookkeeping ────────────────────────────────────────────────

    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_connection(&self, conn: Arc<ConnectionHandle>) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.id, conn);
    }

    pub fn remove_connection(&self, id: u64) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn connections_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    // ── Request handling ──────────────────────────────────────────────────────

    /// Dispatch one request with the configured deadline.  The handler runs
    /// to completion either way; past the deadline the client gets a
    /// REQUEST_TIMEOUT response.
    pub fn handle_request(
        self: &Arc<Self>,
        conn: Arc<ConnectionHandle>,
        request_id: String,
        method: String,
        params: Value,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            service.in_flight.fetch_add(1, Ordering::SeqCst);
            let work = tokio::spawn({
                let service = service.clone();
                let conn = conn.clone();
                let method = method.clone();
                async move {
                    let result = service.dispatch(&conn, &method, params).await;
                    service.in_flight.fetch_sub(1, Ordering::SeqCst);
                    result
                }
            });

            let envelope = match tokio::time::timeout(service.request_timeout(), work).await {
                Ok(Ok(Ok(value))) => Envelope::response_ok(&request_id, value),
                Ok(Ok(Err(e))) => Envelope::response_err(&request_id, e.to_rpc()),
                Ok(Err(join_error)) => {
                    // A panicking handler must not take the daemon down.
                    error!(method, error = %join_error, "request handler panicked");
                    Envelope::response_err(
                        &request_id,
                        RpcError {
                            code: codes::INTERNAL,
                            message: "internal error".to_string(),
                            data: None,
                        },
                    )
                }
                Err(_elapsed) => {
                    // The detached handler still runs to completion.
                    Envelope::response_err(&request_id, DaemonError::RequestTimeout.to_rpc())
                }
            };
            conn.respond(envelope);
        });
    }

    pub async fn dispatch(
        self: &Arc<Self>,
        conn: &Arc<ConnectionHandle>,
        method: &str,
        params: Value,
    ) -> Result<Value, DaemonError> {
        if !self.accepting.load(Ordering::SeqCst)
            && !matches!(method, "daemon.ping" | "daemon.status")
        {
            return Err(DaemonError::ShutdownInProgress);
        }
        debug!(method, conn = conn.id, "rpc dispatch");

        match method {
            "daemon.ping" => Ok(json!({ "pong": true })),
            "daemon.status" => Ok(self.status()),
            "daemon.shutdown" => self.handle_shutdown(params),
            "daemon.reload" => self.handle_reload(),

            "agent.list" => Ok(self.agent_list()),
            "agent.get" => self.agent_get(params),
            "agent.spawn" => self.agent_spawn(params),
            "agent.continue" => self.agent_continue(params),
            "agent.listCheckpoints" => self.agent_list_checkpoints(params),
            "agent.terminate" => self.agent_terminate(params),
            "agent.pause" => self.agent_gate(params, true),
            "agent.resume" => self.agent_gate(params, false),
            "agent.send" => self.agent_send(params),
            "agent.snapshot" => self.agent_snapshot(params),

            "channel.list" => Ok(self.channel_list()),
            "channel.get" => self.channel_get(params),
            "channel.connect" => self.channel_connect(params).await,
            "channel.disconnect" => self.channel_disconnect(params).await,
            "channel.reconnect" => self.channel_reconnect(params).await,

            "conversation.list" => Ok(self.conversation_list()),
            "conversation.get" => self.conversation_get(params),
            "conversation.unbind" => self.conversation_unbind(params),

            "config.get" => Ok(self.config_get()),
            "config.validate" => self.config_validate(params),

            "onboard.status" => Ok(self.onboard_status()),
            "onboard.execute" => self.onboard_execute(params),

            "scheduler.list" => Ok(self.scheduler_list()),
            "scheduler.trigger" => self.scheduler_trigger(params).await,

            "subscribe" => self.handle_subscribe(conn, params),
            "unsubscribe" => self.handle_unsubscribe(conn, params),

            other => Err(DaemonError::MethodUnknown(other.to_string())),
        }
    }

    // ── daemon.* ──────────────────────────────────────────────────────────────

    fn status(&self) -> Value {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let live = sessions
            .values()
            .filter(|e| !e.session.status().is_terminal())
            .count();
        json!({
            "version": VERSION,
            "uptime_ms": (Utc::now() - self.started_at).num_milliseconds(),
            "channels": self.registry.list().len(),
            "sessions": { "total": sessions.len(), "live": live },
            "scheduler_jobs": self.scheduler.list().len(),
            "in_flight": self.in_flight.load(Ordering::SeqCst),
            "accepting": self.accepting.load(Ordering::SeqCst),
        })
    }

    fn handle_shutdown(self: &Arc<Self>, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(default = "default_mode")]
            mode: String,
            #[serde(default, alias = "deadlineMs")]
            deadline_ms: Option<u64>,
        }
        fn default_mode() -> String {
            "graceful".to_string()
        }

        let params: Params = parse_params(params)?;
        if params.mode != "graceful" && params.mode != "hard" {
            return Err(DaemonError::InvalidParams(format!(
                "unknown shutdown mode \"{}\"",
                params.mode
            )));
        }
        let deadline = Duration::from_millis(params.deadline_ms.unwrap_or(5_000));
        let graceful = params.mode == "graceful";

        let service = self.clone();
        tokio::spawn(async move {
            service.run_shutdown(graceful, deadline).await;
        });
        Ok(json!({ "shutting_down": true, "mode": params.mode }))
    }

    async fn run_shutdown(self: Arc<Self>, graceful: bool, deadline: Duration) {
        info!(graceful, "shutdown initiated");
        self.accepting.store(false, Ordering::SeqCst);

        if graceful {
            // Wait for in-flight requests (the shutdown request itself does
            // not count).
            let deadline_at = tokio::time::Instant::now() + deadline;
            while self.in_flight.load(Ordering::SeqCst) > 1
                && tokio::time::Instant::now() < deadline_at
            {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }

        // Abort remaining sessions.
        let entries: Vec<Arc<AgentSession>> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.values().map(|e| e.session.clone()).collect()
        };
        for session in entries {
            if !session.status().is_terminal() {
                session.terminate();
            }
        }

        // Close channels.
        for channel in self.registry.list() {
            if let Err(e) = channel.disconnect().await {
                warn!(channel = %channel.id(), error = %e, "disconnect during shutdown failed");
            }
        }

        let _ = self.shutdown_tx.send(true);
        info!("shutdown complete");
    }

    fn handle_reload(self: &Arc<Self>) -> Result<Value, DaemonError> {
        let new_config = tomte_config::load(self.config_path.as_deref())
            .map_err(|e| DaemonError::ConfigInvalid(e.to_string()))?;
        let problems = tomte_config::validate(&new_config);
        if !problems.is_empty() {
            return Err(DaemonError::ConfigInvalid(problems.join("; ")));
        }

        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config.clone();

        // Scheduler jobs are rebuilt in place; channel and session topology
        // changes require a restart.
        self.scheduler.clear();
        self.register_jobs(&new_config)
            .map_err(|e| DaemonError::ConfigInvalid(e.to_string()))?;

        info!("configuration reloaded");
        Ok(json!({ "reloaded": ["config", "agent", "scheduler"] }))
    }

    // ── agent.* ───────────────────────────────────────────────────────────────

    fn agent_info(session: &Arc<AgentSession>) -> Value {
        json!({
            "id": session.id(),
            "adapter": session.adapter_name(),
            "status": session.status(),
            "created_at": session.created_at().to_rfc3339(),
            "tags": session.tags(),
            "task": session.task(),
            "metrics": session.metrics(),
        })
    }

    fn agent_list(&self) -> Value {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Value> = sessions
            .values()
            .map(|e| Self::agent_info(&e.session))
            .collect();
        list.sort_by(|a, b| {
            a["created_at"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["created_at"].as_str().unwrap_or_default())
        });
        json!(list)
    }

    fn lookup_session(&self, id: &SessionId) -> Result<Arc<AgentSession>, DaemonError> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(id)
            .map(|e| e.session.clone())
            .ok_or_else(|| DaemonError::Agent(AgentError::NotFound(id.clone())))
    }

    fn agent_get(&self, params: Value) -> Result<Value, DaemonError> {
        let id = agent_id_param(params)?;
        let session = self.lookup_session(&id)?;
        let mut info = Self::agent_info(&session);
        info["pending_suspensions"] = json!(session
            .pending_suspensions()
            .into_iter()
            .map(|(tool_call_id, request)| json!({
                "tool_call_id": tool_call_id,
                "request": request,
            }))
            .collect::<Vec<_>>());
        info["conversation"] = match self.conversations.destination_for(&id) {
            Some(dest) => json!(conversation_key(&dest)),
            None => Value::Null,
        };
        Ok(info)
    }

    fn agent_spawn(self: &Arc<Self>, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Params {
            adapter: Option<String>,
            task: Option<String>,
            tags: Vec<String>,
            metadata: serde_json::Map<String, Value>,
            input: Option<String>,
            model: Option<String>,
            #[serde(alias = "channelId")]
            channel_id: Option<String>,
            r#ref: Option<String>,
        }
        let params: Params = parse_params(params)?;

        let bind = match (&params.channel_id, &params.r#ref) {
            (Some(channel_id), Some(r#ref)) => Some(Destination {
                channel_id: ChannelId::from(channel_id.as_str()),
                r#ref: r#ref.clone(),
                metadata: DestinationMeta {
                    conversation_type: ConversationType::Direct,
                    title: None,
                    participant_count: None,
                    platform_data: serde_json::Map::new(),
                },
            }),
            (None, None) => None,
            _ => {
                return Err(DaemonError::InvalidParams(
                    "channel_id and ref must be provided together".into(),
                ))
            }
        };

        let config = self.build_session_config(
            params.adapter.as_deref(),
            params.model,
            params.task,
            params.tags,
            params.metadata,
            params.input,
        )?;
        let id = self.spawn_session(config, bind);
        Ok(json!({ "agent_id": id }))
    }

    fn agent_continue(self: &Arc<Self>, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(alias = "agentId")]
            agent_id: String,
            input: String,
            #[serde(default)]
            model: Option<String>,
        }
        let params: Params = parse_params(params)?;
        let id = SessionId::from(params.agent_id.as_str());

        // A still-live session cannot be restored over.
        if let Ok(session) = self.lookup_session(&id) {
            if !session.status().is_terminal() {
                return Err(DaemonError::Agent(AgentError::InvalidState(format!(
                    "session {id} is {}; terminate it before continuing",
                    session.status()
                ))));
            }
        }

        let checkpoint = {
            let store = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
            store
                .get(&id)
                .and_then(|list| list.last().cloned())
                .ok_or_else(|| DaemonError::Agent(AgentError::NotFound(id.clone())))?
        };

        let adapter_name = checkpoint.adapter_name.clone();
        let config = self.build_session_config(
            Some(&adapter_name),
            params.model,
            None,
            Vec::new(),
            serde_json::Map::new(),
            None,
        )?;
        let session = AgentSession::restore(checkpoint, config)?;
        session.send(params.input)?;

        let restored_id = session.id().clone();
        self.adopt_session(session);
        Ok(json!({ "agent_id": restored_id }))
    }

    fn agent_list_checkpoints(&self, params: Value) -> Result<Value, DaemonError> {
        let id = agent_id_param(params)?;
        let store = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let list: Vec<Value> = store
            .get(&id)
            .map(|checkpoints| {
                checkpoints
                    .iter()
                    .map(|c| {
                        json!({
                            "timestamp": c.timestamp.to_rfc3339(),
                            "adapter_name": c.adapter_name,
                            "metrics": c.session.metrics,
                            "messages": c.messages.len(),
                            "suspended_tools": c
                                .tool_executions
                                .iter()
                                .filter(|t| t.suspension.is_some())
                                .count(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!(list))
    }

    fn agent_terminate(&self, params: Value) -> Result<Value, DaemonError> {
        let id = agent_id_param(params)?;
        let session = self.lookup_session(&id)?;
        session.terminate();
        Ok(json!({ "terminated": true }))
    }

    fn agent_gate(&self, params: Value, pause: bool) -> Result<Value, DaemonError> {
        let id = agent_id_param(params)?;
        let session = self.lookup_session(&id)?;
        if pause {
            session.pause()?;
        } else {
            session.resume()?;
        }
        Ok(json!({ "ok": true }))
    }

    fn agent_send(&self, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(alias = "agentId")]
            agent_id: String,
            message: String,
        }
        let params: Params = parse_params(params)?;
        let id = SessionId::from(params.agent_id.as_str());
        let session = self.lookup_session(&id)?;
        session.send(params.message)?;
        Ok(json!({ "queued": true }))
    }

    fn agent_snapshot(&self, params: Value) -> Result<Value, DaemonError> {
        let id = agent_id_param(params)?;
        let session = self.lookup_session(&id)?;
        let checkpoint = session.checkpoint();
        self.store_checkpoint_value(&id, checkpoint.clone());
        serde_json::to_value(&checkpoint)
            .map_err(|e| DaemonError::InvalidParams(format!("checkpoint serialisation: {e}")))
    }

    // ── Session plumbing ──────────────────────────────────────────────────────

    fn build_session_config(
        &self,
        adapter: Option<&str>,
        model: Option<String>,
        task: Option<String>,
        tags: Vec<String>,
        metadata: serde_json::Map<String, Value>,
        initial_input: Option<String>,
    ) -> Result<SessionConfig, DaemonError> {
        let defaults = self.agent_defaults();
        let adapter_name = adapter.unwrap_or(&defaults.adapter).to_string();
        let factory = {
            let adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
            adapters.get(&adapter_name).cloned()
        }
        .ok_or_else(|| {
            DaemonError::InvalidParams(format!("unknown agent adapter \"{adapter_name}\""))
        })?;

        let model = model.or_else(|| defaults.model.clone());
        let mut config = SessionConfig::new(factory(&defaults, model.as_deref()));
        config.tools = self.tools.clone();
        config.injectors = Arc::new(InjectorPipeline::standard(&defaults));
        config.model = model;
        config.timezone = defaults.timezone.clone();
        config.guidance_path = defaults.guidance_path.clone();
        config.task = task;
        config.tags = tags;
        config.metadata = metadata;
        config.initial_input = initial_input;
        Ok(config)
    }

    fn spawn_session(self: &Arc<Self>, config: SessionConfig, bind: Option<Destination>) -> SessionId {
        let session = AgentSession::create(config);
        if let Some(destination) = bind {
            self.conversations.bind(destination, session.id().clone());
        }
        let id = session.id().clone();
        self.adopt_session(session);
        id
    }

    /// Wire a session into the daemon: bridge task + run task + map entry.
    fn adopt_session(self: &Arc<Self>, session: Arc<AgentSession>) {
        let id = session.id().clone();
        let bridge_task = self.spawn_bridge(session.clone());
        let run_task = tokio::spawn(session.clone().run());
        let entry = SessionEntry {
            session,
            run_task,
            bridge_task,
        };
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = sessions.insert(id.clone(), entry) {
            // A terminal predecessor (agent.continue) is replaced; its tasks
            // are already finished or moribund.
            old.run_task.abort();
            old.bridge_task.abort();
        }
        info!(session = %id, "session adopted");
    }

    /// Forward session events to `agent.output` subscribers (blocking
    /// back-pressure) and to the bound channel as outbound intents.  Also
    /// stores checkpoints on pause/terminal transitions.
    fn spawn_bridge(self: &Arc<Self>, session: Arc<AgentSession>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        let capacity = self.outbox_capacity();
        let mut stream = session.events_with(capacity, OverflowPolicy::Block);
        tokio::spawn(async move {
            let agent_id = session.id().clone();
            while let Some(event) = stream.next().await {
                for conn in service.connections_snapshot() {
                    for sub in conn.subscriptions.matching(SubscriptionType::AgentOutput) {
                        if sub.wants_agent(agent_id.as_str()) {
                            conn.notify_blocking(
                                "agent.output",
                                json!({
                                    "subscription_id": sub.id,
                                    "agent_id": agent_id,
                                    "event": event,
                                }),
                            )
                            .await;
                        }
                    }
                }

                match &event {
                    SessionEvent::Status {
                        status: SessionStatus::Paused,
                    }
                    | SessionEvent::Done { .. } => {
                        service.store_checkpoint_value(&agent_id, session.checkpoint());
                    }
                    _ => {}
                }

                if let Some(destination) = service.conversations.destination_for(&agent_id) {
                    if let Some(intent) = intent_for(&event, destination) {
                        let channel_id = intent.destination().channel_id.clone();
                        if let Err(e) = service.registry.process(&channel_id, intent).await {
                            warn!(session = %agent_id, error = %e, "outbound intent failed");
                        }
                    }
                }
            }
        })
    }

    fn store_checkpoint_value(&self, id: &SessionId, checkpoint: Checkpoint) {
        let mut store = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        store.entry(id.clone()).or_default().push(checkpoint);
    }

    fn spawn_pulse(self: &Arc<Self>, job: &str, task: &str) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("is_pulse".to_string(), json!(true));
        metadata.insert("job".to_string(), json!(job));
        match self.build_session_config(
            None,
            None,
            Some(task.to_string()),
            vec!["pulse".to_string()],
            metadata,
            Some(task.to_string()),
        ) {
            Ok(config) => {
                let id = self.spawn_session(config, None);
                info!(job, session = %id, "pulse session spawned");
            }
            Err(e) => warn!(job, error = %e, "pulse spawn failed"),
        }
    }

    /// Route an inbound message to its bound session, or auto-spawn one.
    async fn route_inbound(self: &Arc<Self>, tagged: &TaggedEvent) {
        let Some(origin) = tagged.event.origin() else {
            return;
        };
        let text = match &tagged.event {
            InboundEvent::MessageReceived { content, .. } => match content {
                InboundContent::Text { text } => text.clone(),
                InboundContent::Media { caption: Some(c), .. } => c.clone(),
                _ => return,
            },
            InboundEvent::CommandReceived { command, args, .. } => {
                if args.is_empty() {
                    format!("/{command}")
                } else {
                    format!("/{command} {args}")
                }
            }
            _ => return,
        };

        if let Some(session_id) = self.conversations.session_for(origin) {
            match self.lookup_session(&session_id) {
                Ok(session) if !session.status().is_terminal() => {
                    if let Err(e) = session.send(text) {
                        warn!(session = %session_id, error = %e, "inbound send failed");
                    }
                    return;
                }
                _ => {
                    // Stale binding; drop it and fall through to auto-spawn.
                    self.conversations.unbind_session(&session_id);
                }
            }
        }

        if !self.agent_defaults().auto_spawn {
            debug!(key = conversation_key(origin), "unbound inbound message dropped");
            return;
        }
        match self.build_session_config(None, None, None, Vec::new(), serde_json::Map::new(), Some(text))
        {
            Ok(config) => {
                let id = self.spawn_session(config, Some(origin.clone()));
                info!(session = %id, key = conversation_key(origin), "session auto-spawned");
            }
            Err(e) => warn!(error = %e, "auto-spawn failed"),
        }
    }

    // ── channel.* ─────────────────────────────────────────────────────────────

    fn channel_info(channel: &Arc<dyn Channel>) -> Value {
        json!({
            "id": channel.id(),
            "adapter": channel.adapter(),
            "status": channel.status(),
        })
    }

    fn channel_list(&self) -> Value {
        json!(self
            .registry
            .list()
            .iter()
            .map(Self::channel_info)
            .collect::<Vec<_>>())
    }

    fn lookup_channel(&self, params: Value) -> Result<Arc<dyn Channel>, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(alias = "channelId")]
            channel_id: String,
        }
        let params: Params = parse_params(params)?;
        let id = ChannelId::from(params.channel_id.as_str());
        self.registry
            .get(&id)
            .ok_or_else(|| DaemonError::Channel(tomte_channels::ChannelError::NotFound(id)))
    }

    fn channel_get(&self, params: Value) -> Result<Value, DaemonError> {
        Ok(Self::channel_info(&self.lookup_channel(params)?))
    }

    async fn channel_connect(&self, params: Value) -> Result<Value, DaemonError> {
        let channel = self.lookup_channel(params)?;
        channel.connect().await?;
        Ok(Self::channel_info(&channel))
    }

    async fn channel_disconnect(&self, params: Value) -> Result<Value, DaemonError> {
        let channel = self.lookup_channel(params)?;
        channel.disconnect().await?;
        Ok(Self::channel_info(&channel))
    }

    async fn channel_reconnect(&self, params: Value) -> Result<Value, DaemonError> {
        let channel = self.lookup_channel(params)?;
        channel.disconnect().await?;
        channel.connect().await?;
        Ok(Self::channel_info(&channel))
    }

    // ── conversation.* ────────────────────────────────────────────────────────

    fn conversation_list(&self) -> Value {
        json!(self.conversations.list())
    }

    fn conversation_get(&self, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            key: String,
        }
        let params: Params = parse_params(params)?;
        self.conversations
            .get(&params.key)
            .map(|binding| json!(binding))
            .ok_or_else(|| {
                DaemonError::InvalidParams(format!("unknown conversation \"{}\"", params.key))
            })
    }

    fn conversation_unbind(&self, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            key: String,
        }
        let params: Params = parse_params(params)?;
        Ok(json!({ "removed": self.conversations.unbind(&params.key) }))
    }

    // ── config.* / onboard.* ──────────────────────────────────────────────────

    fn config_get(&self) -> Value {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut value = serde_json::to_value(&config).unwrap_or(Value::Null);
        // Never hand secrets to control clients.
        if let Some(channels) = value.get_mut("channels").and_then(|v| v.as_array_mut()) {
            for channel in channels {
                if channel.get("token").map(|t| !t.is_null()).unwrap_or(false) {
                    channel["token"] = json!("***");
                }
            }
        }
        value
    }

    fn config_validate(&self, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Params {
            config: Option<Value>,
        }
        let params: Params = parse_params(params)?;

        let (config, parse_error) = match params.config {
            Some(raw) => match serde_json::from_value::<Config>(raw) {
                Ok(config) => (Some(config), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (
                Some(self.config.read().unwrap_or_else(|e| e.into_inner()).clone()),
                None,
            ),
        };

        let mut problems = Vec::new();
        if let Some(e) = parse_error {
            problems.push(format!("config does not match the schema: {e}"));
        }
        if let Some(config) = &config {
            problems.extend(tomte_config::validate(config));
            for job in &config.scheduler.jobs {
                if let Err(e) = tomte_scheduler::validate_schedule(&job.schedule) {
                    problems.push(e.to_string());
                }
            }
        }
        Ok(json!({ "valid": problems.is_empty(), "problems": problems }))
    }

    fn onboard_steps(&self) -> Vec<(String, bool, String)> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner()).clone();
        let problems = tomte_config::validate(&config);

        let mut steps = Vec::new();
        steps.push((
            "config".to_string(),
            problems.is_empty(),
            if problems.is_empty() {
                "configuration is valid".to_string()
            } else {
                problems.join("; ")
            },
        ));
        steps.push((
            "channels".to_string(),
            !config.channels.is_empty(),
            format!("{} channel(s) configured", config.channels.len()),
        ));
        let adapter = config.agent.adapter.clone();
        let adapter_known = self
            .adapters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&adapter);
        steps.push((
            "agent".to_string(),
            adapter_known,
            format!("default adapter \"{adapter}\""),
        ));
        steps
    }

    fn onboard_status(&self) -> Value {
        let steps: Vec<Value> = self
            .onboard_steps()
            .into_iter()
            .map(|(step, complete, detail)| json!({
                "step": step,
                "complete": complete,
                "detail": detail,
            }))
            .collect();
        let complete = steps
            .iter()
            .all(|s| s["complete"].as_bool().unwrap_or(false));
        json!({ "complete": complete, "steps": steps })
    }

    fn onboard_execute(&self, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            step: String,
        }
        let params: Params = parse_params(params)?;
        self.onboard_steps()
            .into_iter()
            .find(|(step, _, _)| step == &params.step)
            .map(|(step, complete, detail)| json!({
                "step": step,
                "ok": complete,
                "detail": detail,
            }))
            .ok_or_else(|| {
                DaemonError::InvalidParams(format!("unknown onboarding step \"{}\"", params.step))
            })
    }

    // ── scheduler.* ───────────────────────────────────────────────────────────

    fn scheduler_list(&self) -> Value {
        json!(self
            .scheduler
            .list()
            .into_iter()
            .map(|job| json!({
                "name": job.name,
                "schedule": job.schedule,
                "next_run": job.next_run.map(|t| t.to_rfc3339()),
            }))
            .collect::<Vec<_>>())
    }

    async fn scheduler_trigger(&self, params: Value) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            name: String,
        }
        let params: Params = parse_params(params)?;
        self.scheduler.trigger(&params.name).await?;
        Ok(json!({ "triggered": params.name }))
    }

    // ── subscribe / unsubscribe ───────────────────────────────────────────────

    fn handle_subscribe(
        &self,
        conn: &Arc<ConnectionHandle>,
        params: Value,
    ) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(rename = "type")]
            sub_type: SubscriptionType,
            #[serde(default)]
            filter: Option<Value>,
        }
        let params: Params = parse_params(params)?;

        let mut log_filter = LogFilter::default();
        let mut agent_filter = AgentOutputFilter::default();
        match params.sub_type {
            SubscriptionType::Logs => {
                if let Some(raw) = params.filter {
                    log_filter = serde_json::from_value(raw)
                        .map_err(|e| DaemonError::InvalidParams(format!("log filter: {e}")))?;
                }
            }
            SubscriptionType::AgentOutput => {
                if let Some(raw) = params.filter {
                    agent_filter = serde_json::from_value(raw)
                        .map_err(|e| DaemonError::InvalidParams(format!("agent filter: {e}")))?;
                }
            }
            SubscriptionType::ChannelEvents | SubscriptionType::LifecycleEvents => {}
        }

        let include_recent = log_filter.include_recent;
        let id = conn
            .subscriptions
            .add(params.sub_type, log_filter.clone(), agent_filter);

        if params.sub_type == SubscriptionType::Logs && include_recent {
            for record in self.log_buffer.recent(&log_filter) {
                conn.notify_dropping(
                    "log",
                    json!({ "subscription_id": id, "record": record }),
                );
            }
        }
        Ok(json!({ "subscription_id": id }))
    }

    fn handle_unsubscribe(
        &self,
        conn: &Arc<ConnectionHandle>,
        params: Value,
    ) -> Result<Value, DaemonError> {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(alias = "subscriptionId")]
            subscription_id: String,
        }
        let params: Params = parse_params(params)?;
        // Unknown and foreign ids succeed silently by contract.
        conn.subscriptions.remove(&params.subscription_id);
        Ok(json!({ "ok": true }))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, DaemonError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| DaemonError::InvalidParams(e.to_string()))
}

fn agent_id_param(params: Value) -> Result<SessionId, DaemonError> {
    #[derive(serde::Deserialize)]
    struct Params {
        #[serde(alias = "agentId")]
        agent_id: String,
    }
    let params: Params = parse_params(params)?;
    Ok(SessionId::from(params.agent_id.as_str()))
}

/// Map a session event to the outbound intent for its bound destination.
fn intent_for(event: &SessionEvent, destination: Destination) -> Option<OutboundIntent> {
    let timestamp = tomte_channels::model::now_ms();
    match event {
        SessionEvent::Thought { .. } => Some(OutboundIntent::AgentThinking {
            destination,
            timestamp,
        }),
        SessionEvent::Output { text, is_final: false } => Some(OutboundIntent::AgentStreaming {
            destination,
            partial: Some(text.clone()),
            timestamp,
        }),
        SessionEvent::Output { text, is_final: true } => Some(OutboundIntent::AgentResponding {
            destination,
            content: OutboundContent::Text {
                text: text.clone(),
                formatting_hint: Some(FormattingHint::Markdown),
            },
            timestamp,
        }),
        SessionEvent::ToolStart {
            tool_name, input, ..
        } => Some(OutboundIntent::AgentToolCall {
            destination,
            tool_name: tool_name.clone(),
            tool_input: Some(input.clone()),
            timestamp,
        }),
        SessionEvent::Error { message, fatal } => Some(OutboundIntent::AgentError {
            destination,
            error: message.clone(),
            recoverable: !fatal,
            timestamp,
        }),
        SessionEvent::ToolEnd { .. }
        | SessionEvent::ToolSuspended { .. }
        | SessionEvent::Status { .. }
        | SessionEvent::Done { .. } => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_service() -> Arc<DaemonService> {
        DaemonService::new(
            Config::default(),
            None,
            LogBuffer::new(64),
            ToolRegistry::new(),
        )
    }

    fn test_conn() -> Arc<ConnectionHandle> {
        let (conn, _rx) = ConnectionHandle::new(1, 16);
        conn
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let service = test_service();
        let conn = test_conn();
        let out = service
            .dispatch(&conn, "daemon.ping", Value::Null)
            .await
            .unwrap();
        assert_eq!(out, json!({ "pong": true }));
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_unknown() {
        let service = test_service();
        let conn = test_conn();
        let err = service
            .dispatch(&conn, "daemon.dance", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::METHOD_UNKNOWN);
    }

    #[tokio::test]
    async fn spawn_send_and_terminate_agent() {
        let service = test_service();
        let conn = test_conn();

        let out = service
            .dispatch(&conn, "agent.spawn", json!({ "task": "testing" }))
            .await
            .unwrap();
        let agent_id = out["agent_id"].as_str().unwrap().to_string();

        let list = service.dispatch(&conn, "agent.list", Value::Null).await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);

        service
            .dispatch(&conn, "agent.send", json!({ "agent_id": agent_id, "message": "hi" }))
            .await
            .unwrap();

        let out = service
            .dispatch(&conn, "agent.terminate", json!({ "agent_id": agent_id }))
            .await
            .unwrap();
        assert_eq!(out, json!({ "terminated": true }));
    }

    #[tokio::test]
    async fn agent_get_unknown_id_is_agent_not_found() {
        let service = test_service();
        let conn = test_conn();
        let err = service
            .dispatch(&conn, "agent.get", json!({ "agent_id": "ghost" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::AGENT_NOT_FOUND);
    }

    #[tokio::test]
    async fn snapshot_then_continue_restores_the_same_id() {
        let service = test_service();
        let conn = test_conn();

        let out = service
            .dispatch(&conn, "agent.spawn", json!({ "input": "hello" }))
            .await
            .unwrap();
        let agent_id = out["agent_id"].as_str().unwrap().to_string();

        // Snapshot before the session finishes is fine; the store keeps it.
        service
            .dispatch(&conn, "agent.snapshot", json!({ "agent_id": agent_id }))
            .await
            .unwrap();
        service
            .dispatch(&conn, "agent.terminate", json!({ "agent_id": agent_id }))
            .await
            .unwrap();
        // Let the run loop observe the terminate.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let out = service
            .dispatch(
                &conn,
                "agent.continue",
                json!({ "agent_id": agent_id, "input": "again" }),
            )
            .await
            .unwrap();
        assert_eq!(out["agent_id"].as_str().unwrap(), agent_id);

        let checkpoints = service
            .dispatch(&conn, "agent.listCheckpoints", json!({ "agent_id": agent_id }))
            .await
            .unwrap();
        assert!(!checkpoints.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_returns_id_and_unsubscribe_is_silent() {
        let service = test_service();
        let conn = test_conn();

        let out = service
            .dispatch(&conn, "subscribe", json!({ "type": "logs" }))
            .await
            .unwrap();
        let sub_id = out["subscription_id"].as_str().unwrap().to_string();
        assert_eq!(conn.subscriptions.len(), 1);

        service
            .dispatch(&conn, "unsubscribe", json!({ "subscription_id": sub_id }))
            .await
            .unwrap();
        // Unknown id succeeds silently.
        service
            .dispatch(&conn, "unsubscribe", json!({ "subscription_id": "sub-nope" }))
            .await
            .unwrap();
        assert!(conn.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn channel_ops_route_by_id() {
        let service = test_service();
        let conn = test_conn();

        let channel = Arc::new(MockChannel::new(ChannelId::from("mock-1")));
        service.registry.register(channel).unwrap();

        let out = service
            .dispatch(&conn, "channel.connect", json!({ "channel_id": "mock-1" }))
            .await
            .unwrap();
        assert_eq!(out["status"], json!("connected"));

        let err = service
            .dispatch(&conn, "channel.connect", json!({ "channel_id": "ghost" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::CHANNEL_NOT_FOUND);
    }

    #[tokio::test]
    async fn config_get_redacts_tokens() {
        let config: Config = serde_yaml::from_str(
            "channels:\n  - adapter: telegram\n    token: super-secret\n",
        )
        .unwrap();
        let service = DaemonService::new(config, None, LogBuffer::new(16), ToolRegistry::new());
        let conn = test_conn();

        let out = service.dispatch(&conn, "config.get", Value::Null).await.unwrap();
        assert_eq!(out["channels"][0]["token"], json!("***"));
    }

    #[tokio::test]
    async fn config_validate_reports_problems() {
        let service = test_service();
        let conn = test_conn();

        let out = service
            .dispatch(
                &conn,
                "config.validate",
                json!({ "config": { "channels": [{ "adapter": "telegram" }] } }),
            )
            .await
            .unwrap();
        assert_eq!(out["valid"], json!(false));
        assert!(!out["problems"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn onboard_status_lists_steps() {
        let service = test_service();
        let conn = test_conn();
        let out = service
            .dispatch(&conn, "onboard.status", Value::Null)
            .await
            .unwrap();
        assert!(out["steps"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn shutdown_refuses_subsequent_rpcs() {
        let service = test_service();
        let conn = test_conn();

        service
            .dispatch(&conn, "daemon.shutdown", json!({ "mode": "hard" }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = service
            .dispatch(&conn, "agent.list", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::SHUTDOWN_IN_PROGRESS);
        // Status stays reachable for observability.
        assert!(service.dispatch(&conn, "daemon.status", Value::Null).await.is_ok());
    }
}
