// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Serialisable session snapshots.
//!
//! A checkpoint is sufficient to resume a session: conversation history,
//! metrics, pending input, and the durable-step state of every tool
//! execution (completed steps plus an optional open suspension).  Captured
//! on demand (`agent.snapshot`) and on pause/terminal transitions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::ChatMessage;
use crate::events::SessionMetrics;
use crate::session::SessionId;
use crate::steps::{CompletedStep, SuspensionRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub adapter_name: String,
    pub session: CheckpointSession,
    pub guidance: GuidanceState,
    pub messages: Vec<ChatMessage>,
    pub adapter_config: serde_json::Value,
    pub tool_executions: Vec<ToolExecutionRecord>,
    /// Inputs that were queued but unprocessed at capture time; re-queued on
    /// restore.
    #[serde(default)]
    pub pending_input: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub task: Option<String>,
    pub metrics: SessionMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuidanceState {
    pub guidance_path: Option<PathBuf>,
    pub memory_writes: Vec<String>,
    pub system_state: serde_json::Value,
}

/// Durable-step state of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub completed_steps: Vec<CompletedStep>,
    /// Set while the tool is parked on an external condition.
    pub suspension: Option<SuspensionRequest>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::SuspensionKind;

    #[test]
    fn checkpoint_json_round_trip() {
        let checkpoint = Checkpoint {
            timestamp: Utc::now(),
            adapter_name: "mock".into(),
            session: CheckpointSession {
                id: SessionId::from("s-1"),
                created_at: Utc::now(),
                tags: vec!["test".into()],
                metadata: serde_json::Map::new(),
                task: Some("do things".into()),
                metrics: SessionMetrics {
                    duration_ms: 120,
                    turns: 2,
                    tool_calls: 1,
                },
            },
            guidance: GuidanceState::default(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            adapter_config: serde_json::json!({"provider": "mock"}),
            tool_executions: vec![ToolExecutionRecord {
                tool_call_id: "t-1".into(),
                tool_name: "deploy".into(),
                input: serde_json::json!({"env": "prod"}),
                completed_steps: vec![],
                suspension: Some(SuspensionRequest {
                    step_id: "__suspension:approval:0".into(),
                    kind: SuspensionKind::Approval,
                    payload: serde_json::json!({"action": "deploy"}),
                }),
            }],
            pending_input: vec!["queued".into()],
        };

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.adapter_name, "mock");
        assert_eq!(back.session.metrics.turns, 2);
        assert_eq!(back.tool_executions.len(), 1);
        assert_eq!(
            back.tool_executions[0].suspension.as_ref().unwrap().step_id,
            "__suspension:approval:0"
        );
        assert_eq!(back.pending_input, vec!["queued"]);
    }
}
