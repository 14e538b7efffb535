// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Canonical intent → Bot API dispatch.
//!
//! `agent_thinking`, `agent_streaming`, and tool intents all surface as a
//! typing chat-action (the platform's typing indicator expires after about
//! five seconds, so streaming re-sends it), debounced per chat to one action
//! per four seconds.  `agent_responding` and `agent_error` send real
//! messages and are therefore not idempotent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use super::api::BotApi;
use super::markdown::to_html_subset;
use super::refs::decode_ref;
use crate::error::ChannelError;
use crate::model::{
    Destination, FormattingHint, IntentReceipt, MediaKind, MediaSource, OutboundContent,
    OutboundIntent, OutboundPart,
};

/// Per-chat suppression window for typing chat-actions.
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(4);

/// Glyph prefixed to `agent_error` messages.
const ERROR_GLYPH: char = '⚠';

pub struct TypingDebounce {
    window: Duration,
    last: Mutex<HashMap<i64, Instant>>,
}

impl TypingDebounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True when a typing action should actually go out for `chat_id`.
    pub fn should_send(&self, chat_id: i64) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last.get(&chat_id) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(chat_id, now);
                true
            }
        }
    }
}

impl Default for TypingDebounce {
    fn default() -> Self {
        Self::new(TYPING_DEBOUNCE)
    }
}

/// Dispatch one intent.  Returns a receipt describing the API outcome.
pub async fn dispatch(
    api: &BotApi,
    debounce: &TypingDebounce,
    intent: &OutboundIntent,
) -> Result<IntentReceipt, ChannelError> {
    let destination = intent.destination();
    let decoded = decode_ref(&destination.r#ref)?;
    let chat_id = decoded.chat_id;
    let thread_id = decoded.thread_id;
    let intent_type = intent.intent_type();

    match intent {
        OutboundIntent::AgentThinking { .. }
        | OutboundIntent::AgentStreaming { .. }
        | OutboundIntent::AgentToolCall { .. }
        | OutboundIntent::AgentToolProgress { .. } => {
            if debounce.should_send(chat_id) {
                api.send_chat_action(chat_id, thread_id, "typing").await?;
            } else {
                debug!(chat_id, "typing action debounced");
            }
            Ok(IntentReceipt::ok(intent_type))
        }

        OutboundIntent::AgentResponding { content, .. } => {
            send_content(api, chat_id, thread_id, destination, content).await?;
            Ok(IntentReceipt::ok(intent_type))
        }

        OutboundIntent::AgentError { error, .. } => {
            let text = format!("{ERROR_GLYPH}\u{fe0f} {error}");
            api.send_message(chat_id, thread_id, &text, None, reply_id(destination))
                .await?;
            Ok(IntentReceipt::ok(intent_type))
        }
    }
}

async fn send_content(
    api: &BotApi,
    chat_id: i64,
    thread_id: Option<i64>,
    destination: &Destination,
    content: &OutboundContent,
) -> Result<(), ChannelError> {
    match content {
        OutboundContent::Text {
            text,
            formatting_hint,
        } => {
            send_text(api, chat_id, thread_id, destination, text, *formatting_hint).await?;
        }
        OutboundContent::Media {
            kind,
            source,
            caption,
            ..
        } => {
            send_media(api, chat_id, thread_id, destination, *kind, source, caption.as_deref())
                .await?;
        }
        OutboundContent::Location { lat, lng } => {
            api.send_location(chat_id, thread_id, *lat, *lng).await?;
        }
        OutboundContent::Compound { parts } => {
            // Text parts join into one message with blank-line separators;
            // media parts dispatch individually afterwards.
            let mut texts: Vec<&str> = Vec::new();
            let mut hint = None;
            for part in parts {
                if let OutboundPart::Text {
                    text,
                    formatting_hint,
                } = part
                {
                    texts.push(text);
                    hint = hint.or(*formatting_hint);
                }
            }
            if !texts.is_empty() {
                let joined = texts.join("\n\n");
                send_text(api, chat_id, thread_id, destination, &joined, hint).await?;
            }
            for part in parts {
                if let OutboundPart::Media {
                    kind,
                    source,
                    caption,
                    ..
                } = part
                {
                    send_media(
                        api,
                        chat_id,
                        thread_id,
                        destination,
                        *kind,
                        source,
                        caption.as_deref(),
                    )
                    .await?;
                }
            }
        }
    }
    Ok(())
}

async fn send_text(
    api: &BotApi,
    chat_id: i64,
    thread_id: Option<i64>,
    destination: &Destination,
    text: &str,
    hint: Option<FormattingHint>,
) -> Result<(), ChannelError> {
    let reply = reply_id(destination);
    let parse_mode = match hint {
        None | Some(FormattingHint::Plain) => None,
        Some(FormattingHint::Markdown) => Some("MarkdownV2"),
        Some(FormattingHint::Html) => Some("HTML"),
    };

    match api
        .send_message(chat_id, thread_id, text, parse_mode, reply)
        .await
    {
        Ok(_) => Ok(()),
        // MarkdownV2 is strict about entity escaping.  When the platform
        // rejects the parse, re-send the same reply converted to the HTML
        // subset instead of losing it.
        Err(ChannelError::Api { code: 400, description })
            if parse_mode == Some("MarkdownV2") && description.contains("can't parse entities") =>
        {
            debug!(chat_id, "markdown parse rejected, falling back to HTML subset");
            let html = to_html_subset(text);
            api.send_message(chat_id, thread_id, &html, Some("HTML"), reply)
                .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn send_media(
    api: &BotApi,
    chat_id: i64,
    thread_id: Option<i64>,
    destination: &Destination,
    kind: MediaKind,
    source: &MediaSource,
    caption: Option<&str>,
) -> Result<(), ChannelError> {
    let url = match source {
        MediaSource::Url { url } => url,
        MediaSource::Bytes { .. } | MediaSource::Stream => {
            return Err(ChannelError::Unsupported(
                "media upload from bytes/stream is not supported; provide a URL source"
                    .to_string(),
            ));
        }
    };
    let (method, field) = media_method(kind);
    api.send_media_url(
        method,
        field,
        chat_id,
        thread_id,
        url,
        caption,
        reply_id(destination),
    )
    .await?;
    Ok(())
}

fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Voice => ("sendVoice", "voice"),
        MediaKind::Document => ("sendDocument", "document"),
        MediaKind::Animation => ("sendAnimation", "animation"),
    }
}

fn reply_id(destination: &Destination) -> Option<i64> {
    destination
        .metadata
        .platform_data
        .get("reply_to_message_id")
        .and_then(|v| v.as_i64())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_suppresses_within_window() {
        let d = TypingDebounce::new(Duration::from_secs(4));
        assert!(d.should_send(1));
        assert!(!d.should_send(1));
    }

    #[test]
    fn debounce_is_per_chat() {
        let d = TypingDebounce::new(Duration::from_secs(4));
        assert!(d.should_send(1));
        assert!(d.should_send(2));
    }

    #[test]
    fn debounce_reopens_after_window() {
        let d = TypingDebounce::new(Duration::from_millis(0));
        assert!(d.should_send(1));
        assert!(d.should_send(1));
    }

    #[test]
    fn media_methods_cover_every_kind() {
        assert_eq!(media_method(MediaKind::Photo).0, "sendPhoto");
        assert_eq!(media_method(MediaKind::Video).0, "sendVideo");
        assert_eq!(media_method(MediaKind::Audio).0, "sendAudio");
        assert_eq!(media_method(MediaKind::Voice).0, "sendVoice");
        assert_eq!(media_method(MediaKind::Document).0, "sendDocument");
        assert_eq!(media_method(MediaKind::Animation).0, "sendAnimation");
    }

    #[test]
    fn reply_id_reads_platform_data() {
        use crate::model::{ChannelId, ConversationType, DestinationMeta};
        let mut platform_data = serde_json::Map::new();
        platform_data.insert("reply_to_message_id".into(), serde_json::json!(17));
        let destination = Destination {
            channel_id: ChannelId::from("c"),
            r#ref: "1::".into(),
            metadata: DestinationMeta {
                conversation_type: ConversationType::Direct,
                title: None,
                participant_count: None,
                platform_data,
            },
        };
        assert_eq!(reply_id(&destination), Some(17));
    }
}
