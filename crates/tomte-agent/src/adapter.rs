// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The adapter seam: sessions treat the LLM as an opaque producer of turns.
//!
//! [`MockAdapter`] echoes input back (optionally following a script of
//! pre-built turns) without any network calls; tests and the default daemon
//! configuration use it.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AgentError;

/// One entry in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new("tool", content)
    }
}

/// A tool invocation requested by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    pub input: serde_json::Value,
}

/// Everything the adapter produced for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnOutput {
    pub thought: Option<String>,
    pub tool_requests: Vec<ToolRequest>,
    /// Output chunks; the session marks the last one `final`.
    pub outputs: Vec<String>,
    /// The adapter considers the task complete.  The session finishes once
    /// this is set and the input queue is drained.
    pub done: bool,
}

/// Inputs handed to the adapter for one turn.
pub struct TurnRequest<'a> {
    pub system_prompt: &'a str,
    pub messages: &'a [ChatMessage],
    pub input: &'a str,
    pub model: Option<&'a str>,
    /// Names of the tools registered for this session.
    pub tools: &'a [String],
}

/// Opaque producer of canonical turns.  The daemon never sees provider
/// payloads, streaming frames, or token accounting — only [`TurnOutput`]s.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Serialisable adapter settings, recorded in checkpoints.
    fn config(&self) -> serde_json::Value {
        json!({})
    }

    async fn take_turn(&self, request: TurnRequest<'_>) -> Result<TurnOutput, AgentError>;
}

/// Scripted adapter for tests and offline runs.
///
/// Pops pre-built turns from a script; when the script is empty it echoes
/// the input back and signals done.
pub struct MockAdapter {
    script: Mutex<VecDeque<TurnOutput>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn scripted(turns: impl IntoIterator<Item = TurnOutput>) -> Self {
        Self {
            script: Mutex::new(turns.into_iter().collect()),
        }
    }

    /// Append a turn to the script.
    pub fn push_turn(&self, turn: TurnOutput) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(turn);
    }
}

#[async_trait]
impl AgentAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "provider": "mock" })
    }

    async fn take_turn(&self, request: TurnRequest<'_>) -> Result<TurnOutput, AgentError> {
        if let Some(turn) = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Ok(turn);
        }
        Ok(TurnOutput {
            thought: Some(format!("processing: {}", request.input)),
            tool_requests: Vec::new(),
            outputs: vec![format!("echo: {}", request.input)],
            done: true,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
