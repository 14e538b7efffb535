// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable step execution for tools.
//!
//! A tool runs inside a [`StepContext`].  Work is divided into *steps*, each
//! identified by a stable id.  [`StepContext::run`] memoises: a step that
//! already has a completed record returns it without re-executing, which is
//! what makes re-running a tool from the top after a suspension cheap and
//! deterministic.
//!
//! The `wait_for_*` and `sleep` operations suspend the tool by returning the
//! [`ToolError::Suspended`] sentinel, which unwinds the tool's call stack via
//! `?`.  Each suspension gets a stable auto-generated id of the form
//! `__suspension:<kind>:<ordinal>`, where the ordinal counts prior
//! suspensions of the same kind in this execution — re-execution after a
//! resume regenerates identical ids.
//!
//! The sentinel is matched specifically by the session's tool runner and
//! never crosses the public API boundary.  Tools must treat the context as
//! the only legal way to block on external conditions; host timers or input
//! reads defeat durable resume.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    Input,
    Approval,
    Event,
    Sleep,
}

impl SuspensionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Approval => "approval",
            Self::Event => "event",
            Self::Sleep => "sleep",
        }
    }
}

/// What a suspended tool is waiting for.  Propagated upward by the session
/// as a pending-request record tied to the tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRequest {
    pub step_id: String,
    pub kind: SuspensionKind,
    /// The request object handed to the wait call (question text, approval
    /// prompt, event name, sleep duration).
    pub payload: serde_json::Value,
}

/// A memoised step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: String,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// Result supplied by the caller when resuming a suspended tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeData {
    pub step_id: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    /// Suspension sentinel.  Internal control flow only.
    #[error("tool suspended at {}", .0.step_id)]
    Suspended(Box<SuspensionRequest>),

    #[error("{message}")]
    Failed { message: String, retryable: bool },
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Per-execution durable step state.
///
/// Rebuilt for every (re-)invocation of a tool from the tracker's completed
/// steps plus, on resume, the supplied [`ResumeData`].
pub struct StepContext {
    completed: Vec<CompletedStep>,
    resume: Option<ResumeData>,
    /// Step ids seen during *this* execution; guards DUPLICATE_STEP.
    seen: HashSet<String>,
    /// Per-kind suspension ordinals for stable auto ids.
    counters: HashMap<SuspensionKind, u32>,
}

impl Default for StepContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StepContext {
    pub fn new() -> Self {
        Self::resuming(Vec::new(), None)
    }

    pub fn resuming(completed: Vec<CompletedStep>, resume: Option<ResumeData>) -> Self {
        Self {
            completed,
            resume,
            seen: HashSet::new(),
            counters: HashMap::new(),
        }
    }

    /// Snapshot of completed steps, in completion order (for checkpoints and
    /// the tracker).
    pub fn completed_steps(&self) -> Vec<CompletedStep> {
        self.completed.clone()
    }

    /// Memoised execution of one step.
    ///
    /// Calling `run` twice with the same id in a single execution is a
    /// [`ToolError::DuplicateStep`] error.
    pub async fn run<T, F, Fut>(&mut self, step_id: &str, f: F) -> Result<T, ToolError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        if !self.seen.insert(step_id.to_string()) {
            return Err(ToolError::DuplicateStep(step_id.to_string()));
        }

        if let Some(record) = self.lookup(step_id) {
            let value = record.result.clone();
            return serde_json::from_value(value)
                .map_err(|e| ToolError::failed(format!("memoised step {step_id}: {e}")));
        }

        if let Some(resume) = self.take_resume(step_id) {
            let out = serde_json::from_value(resume.result.clone())
                .map_err(|e| ToolError::failed(format!("resume result for {step_id}: {e}")))?;
            self.record(step_id, resume.result);
            return Ok(out);
        }

        let out = f()
            .await
            .map_err(|e| ToolError::failed(format!("step {step_id}: {e}")))?;
        let value = serde_json::to_value(&out)
            .map_err(|e| ToolError::failed(format!("step {step_id} result: {e}")))?;
        self.record(step_id, value);
        Ok(out)
    }

    /// Suspend until the user supplies input.
    pub fn wait_for_user_input(
        &mut self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        self.suspend(SuspensionKind::Input, request)
    }

    /// Suspend until an operator approves or denies.
    pub fn wait_for_approval(
        &mut self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        self.suspend(SuspensionKind::Approval, request)
    }

    /// Suspend until a named external event fires.
    pub fn wait_for_event(
        &mut self,
        name: &str,
        opts: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        let payload = serde_json::json!({
            "event": name,
            "opts": opts,
        });
        self.suspend(SuspensionKind::Event, payload)
    }

    /// Suspend for a duration.  The session schedules the wake-up.
    pub fn sleep(&mut self, ms: u64) -> Result<(), ToolError> {
        let payload = serde_json::json!({ "duration_ms": ms });
        self.suspend(SuspensionKind::Sleep, payload).map(|_| ())
    }

    fn suspend(
        &mut self,
        kind: SuspensionKind,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let counter = self.counters.entry(kind).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        let step_id = format!("__suspension:{}:{}", kind.label(), ordinal);

        if !self.seen.insert(step_id.clone()) {
            return Err(ToolError::DuplicateStep(step_id));
        }
        if let Some(record) = self.lookup(&step_id) {
            return Ok(record.result.clone());
        }
        if let Some(resume) = self.take_resume(&step_id) {
            self.record(&step_id, resume.result.clone());
            return Ok(resume.result);
        }
        Err(ToolError::Suspended(Box::new(SuspensionRequest {
            step_id,
            kind,
            payload,
        })))
    }

    fn lookup(&self, step_id: &str) -> Option<&CompletedStep> {
        self.completed.iter().find(|s| s.step_id == step_id)
    }

    fn take_resume(&mut self, step_id: &str) -> Option<ResumeData> {
        if self.resume.as_ref().map(|r| r.step_id.as_str()) == Some(step_id) {
            self.resume.take()
        } else {
            None
        }
    }

    fn record(&mut self, step_id: &str, result: serde_json::Value) {
        self.completed.push(CompletedStep {
            step_id: step_id.to_string(),
            result,
            completed_at: Utc::now(),
        });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
