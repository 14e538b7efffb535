// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Agent session lifecycle: the run loop, the opaque LLM adapter seam,
//! durable tool steps with suspension/resume, checkpoints, and the context
//! injector pipeline.

pub mod adapter;
pub mod checkpoint;
mod error;
pub mod events;
pub mod inject;
pub mod session;
pub mod steps;
pub mod tools;

pub use adapter::{AgentAdapter, ChatMessage, MockAdapter, ToolRequest, TurnOutput, TurnRequest};
pub use checkpoint::{Checkpoint, CheckpointSession, GuidanceState, ToolExecutionRecord};
pub use error::AgentError;
pub use events::{SessionEvent, SessionMetrics, SessionStatus};
pub use inject::{
    ContextInjector, DatetimeInjector, InjectorContext, InjectorPipeline, PulseInjector,
    SkillsInjector,
};
pub use session::{AgentSession, SessionConfig, SessionId};
pub use steps::{
    CompletedStep, ResumeData, StepContext, SuspensionKind, SuspensionRequest, ToolError,
};
pub use tools::{Tool, ToolRegistry, ToolSchema};
