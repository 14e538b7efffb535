// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Restoring a checkpoint into a session configured with a different
    /// adapter is a hard error.
    #[error("adapter mismatch: checkpoint was taken with \"{expected}\", config uses \"{actual}\"")]
    AdapterMismatch { expected: String, actual: String },

    #[error("adapter error: {0}")]
    Adapter(String),
}
