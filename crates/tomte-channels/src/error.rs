// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::model::ChannelId;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel not found: {0}")]
    NotFound(ChannelId),

    #[error("duplicate channel id: {0}")]
    Duplicate(ChannelId),

    #[error("invalid channel state: {0}")]
    InvalidState(String),

    /// Well-formed platform API failure; carries the platform's own code and
    /// description.
    #[error("platform API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unsupported content: {0}")]
    Unsupported(String),

    /// Ref grammar violations.  The message is surfaced verbatim.
    #[error("{0}")]
    InvalidRef(String),

    #[error("media error: {0}")]
    Media(String),

    /// Raised by the mock adapter's configured synthetic failures.
    #[error("simulated failure: {0}")]
    Simulated(String),
}
