// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::steps::SuspensionRequest;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
    Terminated,
}

impl SessionStatus {
    /// Terminal states reject `send`, `pause`, and `resume`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Aborted | Self::Terminated
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub duration_ms: i64,
    pub turns: u64,
    pub tool_calls: u64,
}

/// Events emitted by a session during its run.
/// Consumers (the daemon's `agent.output` subscriptions, intent bridging)
/// subscribe to these to drive their output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The adapter's reasoning summary for the current turn.
    Thought { text: String },
    /// A chunk of agent output; `final` marks the last chunk of a turn.
    Output {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
        retryable: bool,
    },
    /// A tool suspended on an external condition; the request is the
    /// pending-request record tied to the tool call.
    ToolSuspended {
        tool_call_id: String,
        request: SuspensionRequest,
    },
    Status { status: SessionStatus },
    Error { message: String, fatal: bool },
    /// Final event of every run.
    Done {
        status: SessionStatus,
        metrics: SessionMetrics,
    },
}
