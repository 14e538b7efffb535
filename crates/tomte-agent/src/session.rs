// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Agent session lifecycle.
//!
//! A session owns exactly one run loop, an unbounded FIFO input queue, a
//! pause gate, an abort signal, and a tool-execution tracker.  The run loop
//! emits [`SessionEvent`]s through a [`tomte_bus::EventEmitter`]; the daemon
//! bridges those into `agent.output` notifications and outbound channel
//! intents.
//!
//! State machine: `idle → running → {paused, completed, failed, aborted,
//! terminated}`, `paused → running`.  Terminal states reject `send`,
//! `pause`, and `resume`.  `pause` takes effect at the next turn boundary.
//!
//! Tool calls run inside a durable [`StepContext`]; a suspended tool parks
//! in the tracker and the session keeps serving other input.  `resume_tool`
//! re-invokes the tool from the top with its memoised steps plus the
//! supplied resume result.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tomte_bus::{EventEmitter, EventStream, OverflowPolicy};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AgentAdapter, ChatMessage, TurnOutput, TurnRequest};
use crate::checkpoint::{Checkpoint, CheckpointSession, GuidanceState, ToolExecutionRecord};
use crate::error::AgentError;
use crate::events::{SessionEvent, SessionMetrics, SessionStatus};
use crate::inject::{InjectorContext, InjectorPipeline};
use crate::steps::{ResumeData, StepContext, SuspensionKind, ToolError};
use crate::tools::ToolRegistry;

/// Opaque session identifier, distinct from channel ids at the type level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to build a session.
pub struct SessionConfig {
    pub adapter: Arc<dyn AgentAdapter>,
    pub tools: Arc<ToolRegistry>,
    pub injectors: Arc<InjectorPipeline>,
    pub model: Option<String>,
    pub timezone: String,
    pub guidance_path: Option<PathBuf>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub task: Option<String>,
    pub initial_input: Option<String>,
}

impl SessionConfig {
    pub fn new(adapter: Arc<dyn AgentAdapter>) -> Self {
        Self {
            adapter,
            tools: Arc::new(ToolRegistry::new()),
            injectors: Arc::new(InjectorPipeline::new()),
            model: None,
            timezone: "UTC".to_string(),
            guidance_path: None,
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
            task: None,
            initial_input: None,
        }
    }
}

enum SessionInput {
    Message(String),
    ResumeTool {
        tool_call_id: String,
        step_id: String,
        result: serde_json::Value,
    },
}

pub struct AgentSession {
    id: SessionId,
    created_at: DateTime<Utc>,
    restored: bool,

    adapter: Arc<dyn AgentAdapter>,
    tools: Arc<ToolRegistry>,
    injectors: Arc<InjectorPipeline>,
    model: Option<String>,
    timezone: String,
    guidance_path: Option<PathBuf>,
    tags: Vec<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
    task: Option<String>,

    status: Mutex<SessionStatus>,
    events: EventEmitter<SessionEvent>,
    queue: Mutex<VecDeque<SessionInput>>,
    queue_notify: Notify,
    paused: watch::Sender<bool>,
    aborted: AtomicBool,
    abort_notify: Notify,
    /// Terminal status requested by `abort` / `terminate`.
    terminal_request: Mutex<Option<SessionStatus>>,

    messages: Mutex<Vec<ChatMessage>>,
    metrics: Mutex<SessionMetrics>,
    tracker: Mutex<Vec<ToolExecutionRecord>>,
    memory_writes: Mutex<Vec<String>>,
    run_claimed: AtomicBool,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession").field("id", &self.id).finish()
    }
}

impl AgentSession {
    pub fn create(config: SessionConfig) -> Arc<Self> {
        Self::build(SessionId::generate(), Utc::now(), config, false)
    }

    fn build(
        id: SessionId,
        created_at: DateTime<Utc>,
        config: SessionConfig,
        restored: bool,
    ) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        let mut queue = VecDeque::new();
        if let Some(input) = &config.initial_input {
            queue.push_back(SessionInput::Message(input.clone()));
        }

        Arc::new(Self {
            id,
            created_at,
            restored,
            adapter: config.adapter,
            tools: config.tools,
            injectors: config.injectors,
            model: config.model,
            timezone: config.timezone,
            guidance_path: config.guidance_path,
            tags: config.tags,
            metadata: config.metadata,
            task: config.task,
            status: Mutex::new(SessionStatus::Idle),
            events: EventEmitter::new(),
            queue: Mutex::new(queue),
            queue_notify: Notify::new(),
            paused,
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
            terminal_request: Mutex::new(None),
            messages: Mutex::new(Vec::new()),
            metrics: Mutex::new(SessionMetrics::default()),
            tracker: Mutex::new(Vec::new()),
            memory_writes: Mutex::new(Vec::new()),
            run_claimed: AtomicBool::new(false),
        })
    }

    /// Reconstruct a session from a checkpoint.
    ///
    /// The config's adapter must match the adapter the checkpoint was taken
    /// with; anything else is a hard error.
    pub fn restore(checkpoint: Checkpoint, config: SessionConfig) -> Result<Arc<Self>, AgentError> {
        let actual = config.adapter.name().to_string();
        if checkpoint.adapter_name != actual {
            return Err(AgentError::AdapterMismatch {
                expected: checkpoint.adapter_name,
                actual,
            });
        }

        let session = Self::build(
            checkpoint.session.id.clone(),
            checkpoint.session.created_at,
            SessionConfig {
                tags: checkpoint.session.tags.clone(),
                metadata: checkpoint.session.metadata.clone(),
                task: checkpoint.session.task.clone(),
                guidance_path: checkpoint.guidance.guidance_path.clone(),
                ..config
            },
            true,
        );
        *session.messages.lock().unwrap_or_else(|e| e.into_inner()) = checkpoint.messages;
        *session.metrics.lock().unwrap_or_else(|e| e.into_inner()) = checkpoint.session.metrics;
        *session.tracker.lock().unwrap_or_else(|e| e.into_inner()) = checkpoint.tool_executions;
        *session.memory_writes.lock().unwrap_or_else(|e| e.into_inner()) =
            checkpoint.guidance.memory_writes;
        {
            let mut queue = session.queue.lock().unwrap_or_else(|e| e.into_inner());
            for input in checkpoint.pending_input {
                queue.push_back(SessionInput::Message(input));
            }
        }
        info!(session = %session.id, "session restored from checkpoint");
        Ok(session)
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn metrics(&self) -> SessionMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open suspensions: `(tool_call_id, request)` pairs.
    pub fn pending_suspensions(&self) -> Vec<(String, crate::steps::SuspensionRequest)> {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|r| {
                r.suspension
                    .clone()
                    .map(|s| (r.tool_call_id.clone(), s))
            })
            .collect()
    }

    /// Default event stream (drop-oldest buffering).
    pub fn events(&self) -> EventStream<SessionEvent> {
        self.events.stream()
    }

    /// Event stream with an explicit buffer policy.  `agent.output`
    /// subscriptions use [`OverflowPolicy::Block`] so tail consumers never
    /// lose output.
    pub fn events_with(&self, capacity: usize, policy: OverflowPolicy) -> EventStream<SessionEvent> {
        self.events.stream_with(capacity, policy)
    }

    // ── Control operations ────────────────────────────────────────────────────

    /// Non-blocking input enqueue.  Legal in idle, running, and paused.
    pub fn send(&self, message: impl Into<String>) -> Result<(), AgentError> {
        self.reject_if_terminal("send")?;
        self.enqueue(SessionInput::Message(message.into()));
        Ok(())
    }

    /// Close the pause gate; takes effect at the next turn boundary.
    /// Idempotent.
    pub fn pause(&self) -> Result<(), AgentError> {
        self.reject_if_terminal("pause")?;
        self.paused.send_replace(true);
        self.queue_notify.notify_one();
        Ok(())
    }

    /// Reopen the pause gate.  Idempotent.
    pub fn resume(&self) -> Result<(), AgentError> {
        self.reject_if_terminal("resume")?;
        self.paused.send_replace(false);
        Ok(())
    }

    /// Request the `aborted` terminal state.  Observed at the next yield of
    /// the run loop.
    pub fn abort(&self) {
        self.request_terminal(SessionStatus::Aborted);
    }

    /// Request the `terminated` terminal state (operator kill).
    pub fn terminate(&self) {
        self.request_terminal(SessionStatus::Terminated);
    }

    fn request_terminal(&self, status: SessionStatus) {
        let mut request = self.terminal_request.lock().unwrap_or_else(|e| e.into_inner());
        if request.is_none() {
            *request = Some(status);
        }
        drop(request);
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_notify.notify_one();
        self.queue_notify.notify_one();
    }

    /// Supply the result for a suspended tool step.  The tool re-runs from
    /// the top on the session's run loop; memoised steps short-circuit.
    pub fn resume_tool(
        &self,
        tool_call_id: &str,
        step_id: &str,
        result: serde_json::Value,
    ) -> Result<(), AgentError> {
        self.reject_if_terminal("resume_tool")?;
        let tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let record = tracker
            .iter()
            .find(|r| r.tool_call_id == tool_call_id)
            .ok_or_else(|| {
                AgentError::InvalidState(format!("no tool execution {tool_call_id}"))
            })?;
        match &record.suspension {
            Some(s) if s.step_id == step_id => {}
            Some(s) => {
                return Err(AgentError::InvalidState(format!(
                    "tool {tool_call_id} is suspended at {}, not {step_id}",
                    s.step_id
                )))
            }
            None => {
                return Err(AgentError::InvalidState(format!(
                    "tool {tool_call_id} is not suspended"
                )))
            }
        }
        drop(tracker);

        self.enqueue(SessionInput::ResumeTool {
            tool_call_id: tool_call_id.to_string(),
            step_id: step_id.to_string(),
            result,
        });
        Ok(())
    }

    /// Resume every tool waiting on the named external event.  Returns how
    /// many suspensions matched.
    pub fn deliver_event(&self, name: &str, payload: serde_json::Value) -> usize {
        let waiting: Vec<(String, String)> = self
            .pending_suspensions()
            .into_iter()
            .filter(|(_, s)| {
                s.kind == SuspensionKind::Event
                    && s.payload.get("event").and_then(|v| v.as_str()) == Some(name)
            })
            .map(|(id, s)| (id, s.step_id))
            .collect();
        let count = waiting.len();
        for (tool_call_id, step_id) in waiting {
            let _ = self.resume_tool(&tool_call_id, &step_id, payload.clone());
        }
        count
    }

    fn reject_if_terminal(&self, op: &str) -> Result<(), AgentError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(AgentError::InvalidState(format!(
                "{op} rejected: session is {status}"
            )));
        }
        Ok(())
    }

    fn enqueue(&self, input: SessionInput) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(input);
        self.queue_notify.notify_one();
    }

    fn pop_input(&self) -> Option<SessionInput> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn injector_context(&self) -> InjectorContext {
        InjectorContext {
            timezone: self.timezone.clone(),
            now: Utc::now(),
            session_id: self.id.clone(),
            guidance_path: self.guidance_path.clone(),
            metadata: self.metadata.clone(),
        }
    }

    // ── Run loop ──────────────────────────────────────────────────────────────

    /// Drive the session to a terminal state.  Exactly one run loop may
    /// exist per session; a second call returns immediately.
    pub async fn run(self: Arc<Self>) {
        if self.run_claimed.swap(true, Ordering::SeqCst) {
            warn!(session = %self.id, "run loop already claimed");
            return;
        }
        info!(session = %self.id, adapter = self.adapter.name(), "session running");
        self.set_status(SessionStatus::Running);
        self.events
            .emit(SessionEvent::Status {
                status: SessionStatus::Running,
            })
            .await;

        let ictx = self.injector_context();
        let system_prompt = self.injectors.system_context(&ictx).await;
        if self.restored {
            let resume_messages = self.injectors.resume_context(&ictx).await;
            self.messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(resume_messages);
            // Re-arm timers for sleeps that were open at capture.
            for (tool_call_id, suspension) in self.pending_suspensions() {
                if suspension.kind == SuspensionKind::Sleep {
                    self.spawn_sleep_timer(&tool_call_id, &suspension);
                }
            }
        }

        let mut paused_rx = self.paused.subscribe();
        let mut adapter_done = false;

        loop {
            if self.aborted.load(Ordering::SeqCst) {
                let status = self
                    .terminal_request
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .unwrap_or(SessionStatus::Aborted);
                self.finish(status).await;
                return;
            }

            if *paused_rx.borrow() {
                self.set_status(SessionStatus::Paused);
                self.events
                    .emit(SessionEvent::Status {
                        status: SessionStatus::Paused,
                    })
                    .await;
                loop {
                    tokio::select! {
                        _ = self.abort_notify.notified() => break,
                        changed = paused_rx.changed() => {
                            if changed.is_err() || !*paused_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                if self.aborted.load(Ordering::SeqCst) {
                    continue;
                }
                self.set_status(SessionStatus::Running);
                self.events
                    .emit(SessionEvent::Status {
                        status: SessionStatus::Running,
                    })
                    .await;
                continue;
            }

            // Next input, or completion once the adapter signalled done,
            // the queue is drained, and no tool is parked on a suspension.
            let input = match self.pop_input() {
                Some(input) => input,
                None if adapter_done && self.pending_suspensions().is_empty() => {
                    self.finish(SessionStatus::Completed).await;
                    return;
                }
                None => {
                    tokio::select! {
                        _ = self.queue_notify.notified() => {}
                        _ = self.abort_notify.notified() => {}
                        _ = paused_rx.changed() => {}
                    }
                    continue;
                }
            };

            match input {
                SessionInput::Message(text) => {
                    self.messages
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(ChatMessage::user(&text));

                    let turn = {
                        let messages = self
                            .messages
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        let tool_names = self.tools.names();
                        self.adapter
                            .take_turn(TurnRequest {
                                system_prompt: &system_prompt,
                                messages: &messages,
                                input: &text,
                                model: self.model.as_deref(),
                                tools: &tool_names,
                            })
                            .await
                    };

                    match turn {
                        Ok(output) => {
                            adapter_done = output.done;
                            self.handle_turn(output).await;
                        }
                        Err(e) => {
                            self.events
                                .emit(SessionEvent::Error {
                                    message: e.to_string(),
                                    fatal: true,
                                })
                                .await;
                            self.finish(SessionStatus::Failed).await;
                            return;
                        }
                    }
                }
                SessionInput::ResumeTool {
                    tool_call_id,
                    step_id,
                    result,
                } => {
                    self.execute_tool(
                        &tool_call_id,
                        Some(ResumeData {
                            step_id,
                            result,
                        }),
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_turn(self: &Arc<Self>, turn: TurnOutput) {
        if let Some(thought) = turn.thought {
            self.events.emit(SessionEvent::Thought { text: thought }).await;
        }

        for request in turn.tool_requests {
            let tool_call_id = Uuid::new_v4().to_string();
            {
                let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
                tracker.push(ToolExecutionRecord {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: request.name.clone(),
                    input: request.input.clone(),
                    completed_steps: Vec::new(),
                    suspension: None,
                });
            }
            {
                let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
                metrics.tool_calls += 1;
            }
            self.events
                .emit(SessionEvent::ToolStart {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: request.name.clone(),
                    input: request.input.clone(),
                })
                .await;
            self.execute_tool(&tool_call_id, None).await;
        }

        let count = turn.outputs.len();
        for (i, text) in turn.outputs.into_iter().enumerate() {
            let is_final = i + 1 == count;
            self.messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(ChatMessage::assistant(&text));
            self.events
                .emit(SessionEvent::Output { text, is_final })
                .await;
            if is_final {
                let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
                metrics.turns += 1;
            }
        }
    }

    /// Run or resume one tool execution.  Tool errors never terminate the
    /// session; they come back as tool results with a retryable flag.
    async fn execute_tool(self: &Arc<Self>, tool_call_id: &str, resume: Option<ResumeData>) {
        let record = {
            let tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.iter().find(|r| r.tool_call_id == tool_call_id).cloned()
        };
        let Some(record) = record else {
            warn!(session = %self.id, tool_call_id, "tool execution record missing");
            return;
        };

        let Some(tool) = self.tools.get(&record.tool_name) else {
            self.events
                .emit(SessionEvent::ToolEnd {
                    tool_call_id: tool_call_id.to_string(),
                    tool_name: record.tool_name.clone(),
                    output: format!("unknown tool: {}", record.tool_name),
                    is_error: true,
                    retryable: false,
                })
                .await;
            return;
        };

        let mut ctx = StepContext::resuming(record.completed_steps.clone(), resume);
        let result = tool.execute(record.input.clone(), &mut ctx).await;

        // Persist step progress regardless of how the execution ended.
        {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = tracker.iter_mut().find(|r| r.tool_call_id == tool_call_id) {
                entry.completed_steps = ctx.completed_steps();
            }
        }

        match result {
            Ok(value) => {
                self.clear_suspension(tool_call_id);
                let output = value.to_string();
                self.messages
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(ChatMessage::tool(format!(
                        "{}: {}",
                        record.tool_name, output
                    )));
                self.events
                    .emit(SessionEvent::ToolEnd {
                        tool_call_id: tool_call_id.to_string(),
                        tool_name: record.tool_name,
                        output,
                        is_error: false,
                        retryable: false,
                    })
                    .await;
            }
            Err(ToolError::Suspended(request)) => {
                debug!(session = %self.id, tool_call_id, step = %request.step_id, "tool suspended");
                {
                    let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) =
                        tracker.iter_mut().find(|r| r.tool_call_id == tool_call_id)
                    {
                        entry.suspension = Some((*request).clone());
                    }
                }
                if request.kind == SuspensionKind::Sleep {
                    self.spawn_sleep_timer(tool_call_id, &request);
                }
                self.events
                    .emit(SessionEvent::ToolSuspended {
                        tool_call_id: tool_call_id.to_string(),
                        request: *request,
                    })
                    .await;
            }
            Err(ToolError::DuplicateStep(step_id)) => {
                self.clear_suspension(tool_call_id);
                self.events
                    .emit(SessionEvent::ToolEnd {
                        tool_call_id: tool_call_id.to_string(),
                        tool_name: record.tool_name,
                        output: format!("duplicate step id: {step_id}"),
                        is_error: true,
                        retryable: false,
                    })
                    .await;
            }
            Err(ToolError::Failed { message, retryable }) => {
                self.clear_suspension(tool_call_id);
                self.events
                    .emit(SessionEvent::ToolEnd {
                        tool_call_id: tool_call_id.to_string(),
                        tool_name: record.tool_name,
                        output: message,
                        is_error: true,
                        retryable,
                    })
                    .await;
            }
        }
    }

    fn clear_suspension(&self, tool_call_id: &str) {
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = tracker.iter_mut().find(|r| r.tool_call_id == tool_call_id) {
            entry.suspension = None;
        }
    }

    /// A sleeping tool resumes itself once the duration elapses; the session
    /// keeps processing input meanwhile.
    fn spawn_sleep_timer(self: &Arc<Self>, tool_call_id: &str, request: &crate::steps::SuspensionRequest) {
        let ms = request
            .payload
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let session = self.clone();
        let tool_call_id = tool_call_id.to_string();
        let step_id = request.step_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            if let Err(e) = session.resume_tool(&tool_call_id, &step_id, serde_json::Value::Null) {
                debug!(session = %session.id, error = %e, "sleep wake-up dropped");
            }
        });
    }

    async fn finish(&self, status: SessionStatus) {
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.duration_ms = (Utc::now() - self.created_at).num_milliseconds();
        }
        self.set_status(status);
        self.events.emit(SessionEvent::Status { status }).await;
        self.events
            .emit(SessionEvent::Done {
                status,
                metrics: self.metrics(),
            })
            .await;
        self.events.complete();
        info!(session = %self.id, %status, "session finished");
    }

    // ── Checkpointing ─────────────────────────────────────────────────────────

    /// Snapshot the session.  Safe to call at any time; reflects the state
    /// at the moment of capture, modulo in-flight work.
    pub fn checkpoint(&self) -> Checkpoint {
        let pending_input: Vec<String> = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|input| match input {
                SessionInput::Message(text) => Some(text.clone()),
                SessionInput::ResumeTool { .. } => None,
            })
            .collect();

        Checkpoint {
            timestamp: Utc::now(),
            adapter_name: self.adapter.name().to_string(),
            session: CheckpointSession {
                id: self.id.clone(),
                created_at: self.created_at,
                tags: self.tags.clone(),
                metadata: self.metadata.clone(),
                task: self.task.clone(),
                metrics: self.metrics(),
            },
            guidance: GuidanceState {
                guidance_path: self.guidance_path.clone(),
                memory_writes: self
                    .memory_writes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone(),
                system_state: serde_json::json!({ "status": self.status().to_string() }),
            },
            messages: self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            adapter_config: self.adapter.config(),
            tool_executions: self.tracker.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            pending_input,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
