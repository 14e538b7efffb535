// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Ref codec: `chatId:threadId?:messageId?`.
//!
//! Colons are retained even when a segment is empty, so every well-formed
//! ref contains exactly two colons (`"-100987654321:42:17"`, `"-100::"`).
//! The routing-grade ref that enters the outbound path excludes the message
//! id segment; the message id travels in destination metadata instead.

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedRef {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub message_id: Option<i64>,
}

pub fn encode_ref(chat_id: i64, thread_id: Option<i64>, message_id: Option<i64>) -> String {
    let thread = thread_id.map(|t| t.to_string()).unwrap_or_default();
    let message = message_id.map(|m| m.to_string()).unwrap_or_default();
    format!("{chat_id}:{thread}:{message}")
}

/// A ref suitable for outbound routing: message id excluded.
pub fn routing_ref(chat_id: i64, thread_id: Option<i64>) -> String {
    encode_ref(chat_id, thread_id, None)
}

pub fn decode_ref(value: &str) -> Result<DecodedRef, ChannelError> {
    let segments: Vec<&str> = value.split(':').collect();
    if segments.len() != 3 {
        return Err(ChannelError::InvalidRef(format!(
            "Invalid ref format: expected chatId:threadId:messageId, got \"{value}\""
        )));
    }

    let chat_id: i64 = segments[0]
        .parse()
        .map_err(|_| ChannelError::InvalidRef("Invalid chat ID in ref".to_string()))?;
    let thread_id = parse_optional(segments[1], "Invalid thread ID in ref")?;
    let message_id = parse_optional(segments[2], "Invalid message ID in ref")?;

    Ok(DecodedRef {
        chat_id,
        thread_id,
        message_id,
    })
}

fn parse_optional(segment: &str, err: &str) -> Result<Option<i64>, ChannelError> {
    if segment.is_empty() {
        return Ok(None);
    }
    segment
        .parse()
        .map(Some)
        .map_err(|_| ChannelError::InvalidRef(err.to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ref_round_trip() {
        let encoded = encode_ref(-100987654321, Some(42), Some(17));
        assert_eq!(encoded, "-100987654321:42:17");
        let decoded = decode_ref(&encoded).unwrap();
        assert_eq!(decoded.chat_id, -100987654321);
        assert_eq!(decoded.thread_id, Some(42));
        assert_eq!(decoded.message_id, Some(17));
    }

    #[test]
    fn empty_segments_round_trip() {
        let encoded = encode_ref(77, None, None);
        assert_eq!(encoded, "77::");
        let decoded = decode_ref(&encoded).unwrap();
        assert_eq!(decoded.thread_id, None);
        assert_eq!(decoded.message_id, None);
    }

    #[test]
    fn routing_ref_excludes_message_id() {
        assert_eq!(routing_ref(-5, Some(9)), "-5:9:");
        assert_eq!(routing_ref(-5, None), "-5::");
    }

    #[test]
    fn non_integer_chat_id_is_rejected() {
        let err = decode_ref("abc::").unwrap_err();
        assert_eq!(err.to_string(), "Invalid chat ID in ref");
    }

    #[test]
    fn wrong_colon_count_is_rejected() {
        assert!(decode_ref("123").is_err());
        assert!(decode_ref("123:4").is_err());
        assert!(decode_ref("123:4:5:6").is_err());
    }

    #[test]
    fn non_integer_thread_id_is_rejected() {
        let err = decode_ref("1:x:").unwrap_err();
        assert_eq!(err.to_string(), "Invalid thread ID in ref");
    }

    #[test]
    fn non_integer_message_id_is_rejected() {
        let err = decode_ref("1::x").unwrap_err();
        assert_eq!(err.to_string(), "Invalid message ID in ref");
    }
}
