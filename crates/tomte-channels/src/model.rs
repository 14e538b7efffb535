// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Canonical, platform-neutral content and event model.
//!
//! Everything that crosses the channel boundary is expressed in these types:
//! adapters map platform updates **into** [`InboundEvent`]s and map
//! [`OutboundIntent`]s **out** to platform API calls.  All enums are tagged
//! (`type` field, snake_case) so they round-trip over the control socket.
//!
//! Consumers match these enums exhaustively — adding a variant is a
//! compile-time event for every consumer.  The only wildcard arms permitted
//! are for the `Unknown` quarantine variants, which exist so that unknown
//! tags arriving over the wire degrade to a logged warning instead of a
//! decode failure.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque channel instance identifier.
///
/// Distinct from the agent session id at the type level so the two can never
/// be cross-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Content ───────────────────────────────────────────────────────────────────

/// Opaque handle to a platform-side media object.  Only the adapter that
/// produced it may interpret `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    pub platform: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Animation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundContent {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        mime_type: Option<String>,
        filename: Option<String>,
        size: Option<u64>,
        caption: Option<String>,
        reference: MediaReference,
    },
    Location {
        lat: f64,
        lng: f64,
    },
    Contact {
        phone: String,
        first: String,
        last: Option<String>,
    },
    Sticker {
        emoji: Option<String>,
        reference: MediaReference,
    },
    PollVote {
        poll_id: String,
        selected: Vec<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormattingHint {
    Plain,
    Markdown,
    Html,
}

/// Where outbound media bytes come from.
///
/// Only `Url` is dispatchable by the Telegram adapter for now; `Bytes` and
/// `Stream` sources fail with a clear error (multipart upload is deferred).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    Url { url: String },
    Bytes { data: Vec<u8> },
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        text: String,
        formatting_hint: Option<FormattingHint>,
    },
    Media {
        kind: MediaKind,
        source: MediaSource,
        caption: Option<String>,
        filename: Option<String>,
    },
    Location {
        lat: f64,
        lng: f64,
    },
    Compound {
        parts: Vec<OutboundPart>,
    },
}

/// A single element of a compound outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPart {
    Text {
        text: String,
        formatting_hint: Option<FormattingHint>,
    },
    Media {
        kind: MediaKind,
        source: MediaSource,
        caption: Option<String>,
        filename: Option<String>,
    },
}

// ── Participants & destinations ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub is_bot: bool,
}

impl Author {
    /// Fallback used when the platform update carries no author.
    pub fn unknown() -> Self {
        Self {
            id: "unknown".to_string(),
            username: None,
            display_name: None,
            is_bot: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
    Channel,
    Thread,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationMeta {
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub participant_count: Option<u32>,
    /// Platform-specific extras (e.g. `reply_to_message_id` for reply
    /// construction).
    #[serde(default)]
    pub platform_data: serde_json::Map<String, serde_json::Value>,
}

/// A channel-scoped routing target.  `ref` is an opaque token produced by
/// the owning adapter; nothing else may parse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub channel_id: ChannelId,
    pub r#ref: String,
    pub metadata: DestinationMeta,
}

// ── Inbound events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    MessageReceived {
        origin: Destination,
        author: Author,
        content: InboundContent,
        message_id: String,
        timestamp: i64,
    },
    MessageEdited {
        origin: Destination,
        author: Author,
        content: InboundContent,
        message_id: String,
        timestamp: i64,
    },
    MessageDeleted {
        origin: Destination,
        message_id: String,
        timestamp: i64,
    },
    ReactionAdded {
        origin: Destination,
        author: Author,
        emoji: String,
        message_id: String,
        timestamp: i64,
    },
    ReactionRemoved {
        origin: Destination,
        author: Author,
        emoji: String,
        message_id: String,
        timestamp: i64,
    },
    CommandReceived {
        origin: Destination,
        author: Author,
        command: String,
        args: String,
        timestamp: i64,
    },
    CallbackReceived {
        origin: Destination,
        author: Author,
        callback_id: String,
        data: Option<String>,
        timestamp: i64,
    },
    ConversationStarted {
        origin: Destination,
        author: Option<Author>,
        timestamp: i64,
    },
    MemberJoined {
        origin: Destination,
        member: Author,
        timestamp: i64,
    },
    MemberLeft {
        origin: Destination,
        member: Author,
        timestamp: i64,
    },
    /// Quarantine for tags this build does not know.  Logged, never acted on.
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    pub fn origin(&self) -> Option<&Destination> {
        match self {
            Self::MessageReceived { origin, .. }
            | Self::MessageEdited { origin, .. }
            | Self::MessageDeleted { origin, .. }
            | Self::ReactionAdded { origin, .. }
            | Self::ReactionRemoved { origin, .. }
            | Self::CommandReceived { origin, .. }
            | Self::CallbackReceived { origin, .. }
            | Self::ConversationStarted { origin, .. }
            | Self::MemberJoined { origin, .. }
            | Self::MemberLeft { origin, .. } => Some(origin),
            Self::Unknown => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "message_received",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::CommandReceived { .. } => "command_received",
            Self::CallbackReceived { .. } => "callback_received",
            Self::ConversationStarted { .. } => "conversation_started",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::Unknown => "unknown",
        }
    }
}

// ── Outbound intents ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundIntent {
    AgentThinking {
        destination: Destination,
        timestamp: i64,
    },
    AgentStreaming {
        destination: Destination,
        partial: Option<String>,
        timestamp: i64,
    },
    AgentResponding {
        destination: Destination,
        content: OutboundContent,
        timestamp: i64,
    },
    AgentToolCall {
        destination: Destination,
        tool_name: String,
        tool_input: Option<serde_json::Value>,
        timestamp: i64,
    },
    AgentToolProgress {
        destination: Destination,
        tool_name: String,
        tool_call_id: String,
        progress: Option<String>,
        timestamp: i64,
    },
    AgentError {
        destination: Destination,
        error: String,
        recoverable: bool,
        timestamp: i64,
    },
}

impl OutboundIntent {
    pub fn destination(&self) -> &Destination {
        match self {
            Self::AgentThinking { destination, .. }
            | Self::AgentStreaming { destination, .. }
            | Self::AgentResponding { destination, .. }
            | Self::AgentToolCall { destination, .. }
            | Self::AgentToolProgress { destination, .. }
            | Self::AgentError { destination, .. } => destination,
        }
    }

    pub fn intent_type(&self) -> &'static str {
        match self {
            Self::AgentThinking { .. } => "agent_thinking",
            Self::AgentStreaming { .. } => "agent_streaming",
            Self::AgentResponding { .. } => "agent_responding",
            Self::AgentToolCall { .. } => "agent_tool_call",
            Self::AgentToolProgress { .. } => "agent_tool_progress",
            Self::AgentError { .. } => "agent_error",
        }
    }

    /// Informational intents may be retried or duplicated without visible
    /// effect; `agent_responding` and `agent_error` may not — every dispatch
    /// sends another message.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            Self::AgentThinking { .. }
                | Self::AgentStreaming { .. }
                | Self::AgentToolCall { .. }
                | Self::AgentToolProgress { .. }
        )
    }
}

/// Confirmation returned by [`crate::Channel::process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentReceipt {
    pub intent_type: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl IntentReceipt {
    pub fn ok(intent_type: &str) -> Self {
        Self {
            intent_type: intent_type.to_string(),
            success: true,
            error: None,
            timestamp: now_ms(),
        }
    }

    pub fn failed(intent_type: &str, error: impl Into<String>) -> Self {
        Self {
            intent_type: intent_type.to_string(),
            success: false,
            error: Some(error.into()),
            timestamp: now_ms(),
        }
    }
}

// ── Channel lifecycle ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connected {
        channel_id: ChannelId,
    },
    Disconnected {
        channel_id: ChannelId,
        reason: Option<String>,
    },
    Reconnecting {
        channel_id: ChannelId,
        attempt: u32,
    },
    ChannelError {
        channel_id: ChannelId,
        error: String,
        recoverable: bool,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Destination {
        Destination {
            channel_id: ChannelId::from("ch-1"),
            r#ref: "1:2:".to_string(),
            metadata: DestinationMeta {
                conversation_type: ConversationType::Group,
                title: Some("Test".into()),
                participant_count: None,
                platform_data: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn inbound_event_json_round_trip() {
        let ev = InboundEvent::CommandReceived {
            origin: dest(),
            author: Author::unknown(),
            command: "settings".into(),
            args: "dark mode".into(),
            timestamp: 1,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"command_received\""));
        let back: InboundEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn unknown_inbound_tag_is_quarantined() {
        let back: InboundEvent =
            serde_json::from_str(r#"{"type":"message_vaporised","payload":42}"#).unwrap();
        assert_eq!(back, InboundEvent::Unknown);
    }

    #[test]
    fn intent_types_match_wire_tags() {
        let intent = OutboundIntent::AgentResponding {
            destination: dest(),
            content: OutboundContent::Text {
                text: "hi".into(),
                formatting_hint: None,
            },
            timestamp: 1,
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert!(json.contains(&format!("\"type\":\"{}\"", intent.intent_type())));
    }

    #[test]
    fn informational_intents_are_classified() {
        let d = dest();
        let thinking = OutboundIntent::AgentThinking {
            destination: d.clone(),
            timestamp: 0,
        };
        let responding = OutboundIntent::AgentResponding {
            destination: d.clone(),
            content: OutboundContent::Text {
                text: "x".into(),
                formatting_hint: None,
            },
            timestamp: 0,
        };
        let error = OutboundIntent::AgentError {
            destination: d,
            error: "e".into(),
            recoverable: true,
            timestamp: 0,
        };
        assert!(thinking.is_informational());
        assert!(!responding.is_informational());
        assert!(!error.is_informational());
    }

    #[test]
    fn channel_id_is_transparent_in_json() {
        let id = ChannelId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
