// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Platform update → canonical event mapping.
//!
//! One raw update can yield zero or more canonical events (zero when the
//! update is dropped, more than one for e.g. a reaction swap).  The rules
//! are mechanical:
//!
//! - text starting with `/` becomes `command_received`; the parse strips the
//!   slash, trims at the first space, and removes an `@bot` suffix
//! - callback updates without an originating message are dropped (no
//!   destination can be built)
//! - membership updates produce `conversation_started` only on the
//!   non-member → member transition
//! - the highest-resolution photo size wins
//! - a missing author maps to the `unknown` fallback

use super::api::{Chat, ChatMemberUpdated, Message, Update, User};
use super::refs::routing_ref;
use crate::model::{
    Author, ChannelId, ConversationType, Destination, DestinationMeta, InboundContent,
    InboundEvent, MediaKind, MediaReference,
};

const PLATFORM: &str = "telegram";

/// Map one raw update into canonical events.  Empty means dropped.
pub fn map_update(update: &Update, channel_id: &ChannelId) -> Vec<InboundEvent> {
    if let Some(message) = &update.message {
        return map_message(message, channel_id, false);
    }
    if let Some(message) = &update.edited_message {
        return map_message(message, channel_id, true);
    }
    if let Some(query) = &update.callback_query {
        // Without an originating message no destination can be built.
        let Some(message) = &query.message else {
            return Vec::new();
        };
        let origin = destination(channel_id, &message.chat, message.message_thread_id, None);
        return vec![InboundEvent::CallbackReceived {
            origin,
            author: author_from(Some(&query.from)),
            callback_id: query.id.clone(),
            data: query.data.clone(),
            timestamp: message.date * 1000,
        }];
    }
    if let Some(member) = &update.my_chat_member {
        return map_membership(member, channel_id);
    }
    if let Some(reaction) = &update.message_reaction {
        let origin = destination(channel_id, &reaction.chat, None, None);
        let author = author_from(reaction.user.as_ref());
        let timestamp = reaction.date * 1000;
        let message_id = reaction.message_id.to_string();
        let mut events = Vec::new();
        for added in reaction
            .new_reaction
            .iter()
            .filter(|r| !reaction.old_reaction.contains(r))
        {
            events.push(InboundEvent::ReactionAdded {
                origin: origin.clone(),
                author: author.clone(),
                emoji: added.emoji.clone().unwrap_or_default(),
                message_id: message_id.clone(),
                timestamp,
            });
        }
        for removed in reaction
            .old_reaction
            .iter()
            .filter(|r| !reaction.new_reaction.contains(r))
        {
            events.push(InboundEvent::ReactionRemoved {
                origin: origin.clone(),
                author: author.clone(),
                emoji: removed.emoji.clone().unwrap_or_default(),
                message_id: message_id.clone(),
                timestamp,
            });
        }
        return events;
    }
    Vec::new()
}

/// Author id used by inbound filters, extracted before mapping.
pub fn author_id(update: &Update) -> Option<String> {
    let user = update
        .message
        .as_ref()
        .and_then(|m| m.from.as_ref())
        .or_else(|| update.edited_message.as_ref().and_then(|m| m.from.as_ref()))
        .or_else(|| update.callback_query.as_ref().map(|q| &q.from))
        .or_else(|| update.my_chat_member.as_ref().and_then(|m| m.from.as_ref()))
        .or_else(|| update.message_reaction.as_ref().and_then(|r| r.user.as_ref()));
    user.map(|u| u.id.to_string())
}

fn map_message(message: &Message, channel_id: &ChannelId, edited: bool) -> Vec<InboundEvent> {
    let timestamp = message.date * 1000;
    let origin = destination(
        channel_id,
        &message.chat,
        message.message_thread_id,
        Some(message.message_id),
    );
    let author = author_from(message.from.as_ref());
    let message_id = message.message_id.to_string();

    // Service messages: membership joins/leaves come in as regular messages.
    if let Some(joined) = &message.new_chat_members {
        return joined
            .iter()
            .map(|user| InboundEvent::MemberJoined {
                origin: origin.clone(),
                member: author_from(Some(user)),
                timestamp,
            })
            .collect();
    }
    if let Some(left) = &message.left_chat_member {
        return vec![InboundEvent::MemberLeft {
            origin,
            member: author_from(Some(left)),
            timestamp,
        }];
    }

    // Commands only apply to unedited text messages.
    if !edited {
        if let Some(text) = &message.text {
            if let Some((command, args)) = parse_command(text) {
                return vec![InboundEvent::CommandReceived {
                    origin,
                    author,
                    command,
                    args,
                    timestamp,
                }];
            }
        }
    }

    let Some(content) = map_content(message) else {
        return Vec::new();
    };

    if edited {
        vec![InboundEvent::MessageEdited {
            origin,
            author,
            content,
            message_id,
            timestamp,
        }]
    } else {
        vec![InboundEvent::MessageReceived {
            origin,
            author,
            content,
            message_id,
            timestamp,
        }]
    }
}

fn map_membership(member: &ChatMemberUpdated, channel_id: &ChannelId) -> Vec<InboundEvent> {
    let was_member = matches!(
        member.old_chat_member.status.as_str(),
        "member" | "administrator" | "creator"
    );
    let is_member = matches!(
        member.new_chat_member.status.as_str(),
        "member" | "administrator" | "creator"
    );
    // Only the non-member → member transition starts a conversation.
    if was_member || !is_member {
        return Vec::new();
    }
    let origin = destination(channel_id, &member.chat, None, None);
    vec![InboundEvent::ConversationStarted {
        origin,
        author: member.from.as_ref().map(|u| author_from(Some(u))),
        timestamp: member.date.unwrap_or(0) * 1000,
    }]
}

/// Parse `/command[@bot] [args…]`.  Returns `None` for ordinary text.
fn parse_command(text: &str) -> Option<(String, String)> {
    let stripped = text.strip_prefix('/')?;
    if stripped.is_empty() {
        return None;
    }
    let (head, rest) = match stripped.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest),
        None => (stripped, ""),
    };
    let command = match head.split_once('@') {
        Some((cmd, _bot)) => cmd,
        None => head,
    };
    if command.is_empty() {
        return None;
    }
    Some((command.to_string(), rest.trim().to_string()))
}

fn map_content(message: &Message) -> Option<InboundContent> {
    let caption = message.caption.clone();

    if let Some(photos) = &message.photo {
        // Telegram sends several renditions; keep the highest resolution.
        let best = photos
            .iter()
            .max_by_key(|p| (p.file_size.unwrap_or(0), p.width * p.height))?;
        return Some(InboundContent::Media {
            kind: MediaKind::Photo,
            mime_type: None,
            filename: None,
            size: best.file_size,
            caption,
            reference: reference(&best.file_id),
        });
    }
    if let Some(video) = &message.video {
        return Some(InboundContent::Media {
            kind: MediaKind::Video,
            mime_type: video.mime_type.clone(),
            filename: video.file_name.clone(),
            size: video.file_size,
            caption,
            reference: reference(&video.file_id),
        });
    }
    if let Some(audio) = &message.audio {
        return Some(InboundContent::Media {
            kind: MediaKind::Audio,
            mime_type: audio.mime_type.clone(),
            filename: audio.file_name.clone(),
            size: audio.file_size,
            caption,
            reference: reference(&audio.file_id),
        });
    }
    if let Some(voice) = &message.voice {
        return Some(InboundContent::Media {
            kind: MediaKind::Voice,
            mime_type: voice.mime_type.clone(),
            filename: None,
            size: voice.file_size,
            caption,
            reference: reference(&voice.file_id),
        });
    }
    if let Some(document) = &message.document {
        return Some(InboundContent::Media {
            kind: MediaKind::Document,
            mime_type: document.mime_type.clone(),
            filename: document.file_name.clone(),
            size: document.file_size,
            caption,
            reference: reference(&document.file_id),
        });
    }
    if let Some(animation) = &message.animation {
        return Some(InboundContent::Media {
            kind: MediaKind::Animation,
            mime_type: animation.mime_type.clone(),
            filename: animation.file_name.clone(),
            size: animation.file_size,
            caption,
            reference: reference(&animation.file_id),
        });
    }
    if let Some(location) = &message.location {
        return Some(InboundContent::Location {
            lat: location.latitude,
            lng: location.longitude,
        });
    }
    if let Some(contact) = &message.contact {
        return Some(InboundContent::Contact {
            phone: contact.phone_number.clone(),
            first: contact.first_name.clone(),
            last: contact.last_name.clone(),
        });
    }
    if let Some(sticker) = &message.sticker {
        return Some(InboundContent::Sticker {
            emoji: sticker.emoji.clone(),
            reference: reference(&sticker.file_id),
        });
    }
    message
        .text
        .as_ref()
        .map(|text| InboundContent::Text { text: text.clone() })
}

fn reference(file_id: &str) -> MediaReference {
    MediaReference {
        platform: PLATFORM.to_string(),
        id: file_id.to_string(),
    }
}

fn author_from(user: Option<&User>) -> Author {
    match user {
        Some(u) => {
            let display_name = match &u.last_name {
                Some(last) => format!("{} {}", u.first_name, last),
                None => u.first_name.clone(),
            };
            Author {
                id: u.id.to_string(),
                username: u.username.clone(),
                display_name: Some(display_name),
                is_bot: u.is_bot,
            }
        }
        None => Author::unknown(),
    }
}

/// Build the canonical destination for a chat.
///
/// The routing ref excludes the message id; the message id travels in
/// `platform_data.reply_to_message_id` for reply construction.
pub fn destination(
    channel_id: &ChannelId,
    chat: &Chat,
    thread_id: Option<i64>,
    reply_to_message_id: Option<i64>,
) -> Destination {
    let conversation_type = match chat.kind.as_str() {
        "private" => ConversationType::Direct,
        "channel" => ConversationType::Channel,
        "supergroup" if chat.is_forum.unwrap_or(false) => ConversationType::Topic,
        "supergroup" | "group" if thread_id.is_some() => ConversationType::Thread,
        _ => ConversationType::Group,
    };

    let mut platform_data = serde_json::Map::new();
    if let Some(reply) = reply_to_message_id {
        platform_data.insert("reply_to_message_id".to_string(), serde_json::json!(reply));
    }
    if let Some(username) = &chat.username {
        platform_data.insert("chat_username".to_string(), serde_json::json!(username));
    }

    Destination {
        channel_id: channel_id.clone(),
        r#ref: routing_ref(chat.id, thread_id),
        metadata: DestinationMeta {
            conversation_type,
            title: chat.title.clone(),
            participant_count: None,
            platform_data,
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::api::Update;

    fn channel() -> ChannelId {
        ChannelId::from("tg-test")
    }

    fn update(raw: serde_json::Value) -> Update {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn command_with_bot_suffix_and_args() {
        let u = update(serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "date": 1700000000,
                "text": "/settings@mybot dark mode",
                "chat": {"id": -200, "type": "group"},
                "from": {"id": 888, "is_bot": false, "first_name": "Alice"}
            }
        }));
        let events = map_update(&u, &channel());
        assert_eq!(events.len(), 1);
        match &events[0] {
            InboundEvent::CommandReceived { command, args, .. } => {
                assert_eq!(command, "settings");
                assert_eq!(args, "dark mode");
            }
            other => panic!("expected command_received, got {other:?}"),
        }
    }

    #[test]
    fn bare_command_has_empty_args() {
        let (command, args) = parse_command("/start").unwrap();
        assert_eq!(command, "start");
        assert_eq!(args, "");
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(parse_command("hello /world").is_none());
        assert!(parse_command("/").is_none());
    }

    #[test]
    fn forum_supergroup_maps_to_topic() {
        let u = update(serde_json::json!({
            "update_id": 2,
            "message": {
                "message_id": 11,
                "date": 1700000000,
                "text": "hi",
                "chat": {"id": -100, "type": "supergroup", "is_forum": true, "title": "Test Forum"},
                "from": {"id": 1, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&u, &channel());
        let origin = events[0].origin().unwrap();
        assert_eq!(origin.metadata.conversation_type, ConversationType::Topic);
        assert_eq!(origin.metadata.title.as_deref(), Some("Test Forum"));
    }

    #[test]
    fn private_chat_maps_to_direct() {
        let u = update(serde_json::json!({
            "update_id": 3,
            "message": {
                "message_id": 12,
                "date": 1700000000,
                "text": "hi",
                "chat": {"id": 55, "type": "private"},
                "from": {"id": 55, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&u, &channel());
        assert_eq!(
            events[0].origin().unwrap().metadata.conversation_type,
            ConversationType::Direct
        );
    }

    #[test]
    fn highest_resolution_photo_wins() {
        let u = update(serde_json::json!({
            "update_id": 4,
            "message": {
                "message_id": 13,
                "date": 1700000000,
                "caption": "Photo caption",
                "photo": [
                    {"file_id": "small", "width": 90, "height": 90, "file_size": 1000},
                    {"file_id": "large", "width": 1280, "height": 1280, "file_size": 50000}
                ],
                "chat": {"id": 55, "type": "private"},
                "from": {"id": 55, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&u, &channel());
        match &events[0] {
            InboundEvent::MessageReceived { content, .. } => match content {
                InboundContent::Media {
                    kind,
                    size,
                    caption,
                    reference,
                    ..
                } => {
                    assert_eq!(*kind, MediaKind::Photo);
                    assert_eq!(*size, Some(50000));
                    assert_eq!(caption.as_deref(), Some("Photo caption"));
                    assert_eq!(reference.platform, "telegram");
                    assert_eq!(reference.id, "large");
                }
                other => panic!("expected media, got {other:?}"),
            },
            other => panic!("expected message_received, got {other:?}"),
        }
    }

    #[test]
    fn missing_author_falls_back_to_unknown() {
        let u = update(serde_json::json!({
            "update_id": 5,
            "message": {
                "message_id": 14,
                "date": 1700000000,
                "text": "anonymous",
                "chat": {"id": -1, "type": "group"}
            }
        }));
        let events = map_update(&u, &channel());
        match &events[0] {
            InboundEvent::MessageReceived { author, .. } => {
                assert_eq!(author.id, "unknown");
                assert!(!author.is_bot);
            }
            other => panic!("expected message_received, got {other:?}"),
        }
    }

    #[test]
    fn callback_without_message_is_dropped() {
        let u = update(serde_json::json!({
            "update_id": 6,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 9, "is_bot": false, "first_name": "B"},
                "data": "vote:1"
            }
        }));
        assert!(map_update(&u, &channel()).is_empty());
    }

    #[test]
    fn callback_with_message_builds_destination() {
        let u = update(serde_json::json!({
            "update_id": 7,
            "callback_query": {
                "id": "cb-2",
                "from": {"id": 9, "is_bot": false, "first_name": "B"},
                "data": "vote:2",
                "message": {
                    "message_id": 40,
                    "date": 1700000000,
                    "chat": {"id": -300, "type": "group"}
                }
            }
        }));
        let events = map_update(&u, &channel());
        match &events[0] {
            InboundEvent::CallbackReceived {
                callback_id, data, ..
            } => {
                assert_eq!(callback_id, "cb-2");
                assert_eq!(data.as_deref(), Some("vote:2"));
            }
            other => panic!("expected callback_received, got {other:?}"),
        }
    }

    #[test]
    fn membership_join_transition_starts_conversation() {
        let u = update(serde_json::json!({
            "update_id": 8,
            "my_chat_member": {
                "chat": {"id": -400, "type": "group", "title": "New Group"},
                "from": {"id": 3, "is_bot": false, "first_name": "C"},
                "date": 1700000000,
                "old_chat_member": {"status": "left", "user": {"id": 42, "is_bot": true, "first_name": "Bot"}},
                "new_chat_member": {"status": "member", "user": {"id": 42, "is_bot": true, "first_name": "Bot"}}
            }
        }));
        let events = map_update(&u, &channel());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], InboundEvent::ConversationStarted { .. }));
    }

    #[test]
    fn membership_demotion_is_ignored() {
        let u = update(serde_json::json!({
            "update_id": 9,
            "my_chat_member": {
                "chat": {"id": -400, "type": "group"},
                "old_chat_member": {"status": "administrator", "user": {"id": 42, "is_bot": true, "first_name": "Bot"}},
                "new_chat_member": {"status": "member", "user": {"id": 42, "is_bot": true, "first_name": "Bot"}}
            }
        }));
        assert!(map_update(&u, &channel()).is_empty());
    }

    #[test]
    fn routing_ref_carries_reply_id_in_metadata() {
        let u = update(serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 17,
                "date": 1700000000,
                "message_thread_id": 42,
                "text": "hi",
                "chat": {"id": -100987654321i64, "type": "supergroup", "is_forum": true},
                "from": {"id": 1, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&u, &channel());
        let origin = events[0].origin().unwrap();
        assert_eq!(origin.r#ref, "-100987654321:42:");
        assert_eq!(
            origin.metadata.platform_data.get("reply_to_message_id"),
            Some(&serde_json::json!(17))
        );
    }

    #[test]
    fn edited_message_maps_to_message_edited() {
        let u = update(serde_json::json!({
            "update_id": 11,
            "edited_message": {
                "message_id": 18,
                "date": 1700000000,
                "text": "fixed typo",
                "chat": {"id": 55, "type": "private"},
                "from": {"id": 55, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&u, &channel());
        assert!(matches!(events[0], InboundEvent::MessageEdited { .. }));
    }

    #[test]
    fn location_contact_sticker_map_one_to_one() {
        let loc = update(serde_json::json!({
            "update_id": 12,
            "message": {
                "message_id": 19, "date": 1,
                "location": {"latitude": 59.3, "longitude": 18.1},
                "chat": {"id": 1, "type": "private"},
                "from": {"id": 1, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&loc, &channel());
        match &events[0] {
            InboundEvent::MessageReceived { content, .. } => {
                assert!(matches!(content, InboundContent::Location { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }

        let sticker = update(serde_json::json!({
            "update_id": 13,
            "message": {
                "message_id": 20, "date": 1,
                "sticker": {"file_id": "stick-1", "emoji": "😀"},
                "chat": {"id": 1, "type": "private"},
                "from": {"id": 1, "is_bot": false, "first_name": "A"}
            }
        }));
        let events = map_update(&sticker, &channel());
        match &events[0] {
            InboundEvent::MessageReceived { content, .. } => match content {
                InboundContent::Sticker { emoji, reference } => {
                    assert_eq!(emoji.as_deref(), Some("😀"));
                    assert_eq!(reference.id, "stick-1");
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reaction_swap_yields_added_and_removed() {
        let u = update(serde_json::json!({
            "update_id": 14,
            "message_reaction": {
                "chat": {"id": -1, "type": "group"},
                "message_id": 30,
                "date": 1700000000,
                "user": {"id": 5, "is_bot": false, "first_name": "E"},
                "old_reaction": [{"type": "emoji", "emoji": "👎"}],
                "new_reaction": [{"type": "emoji", "emoji": "👍"}]
            }
        }));
        let events = map_update(&u, &channel());
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], InboundEvent::ReactionAdded { .. }));
        assert!(matches!(events[1], InboundEvent::ReactionRemoved { .. }));
    }

    #[test]
    fn filter_author_id_extraction() {
        let u = update(serde_json::json!({
            "update_id": 15,
            "message": {
                "message_id": 1, "date": 1, "text": "x",
                "chat": {"id": 1, "type": "private"},
                "from": {"id": 888, "is_bot": false, "first_name": "A"}
            }
        }));
        assert_eq!(author_id(&u).as_deref(), Some("888"));

        let system = update(serde_json::json!({
            "update_id": 16,
            "message": {
                "message_id": 2, "date": 1, "text": "x",
                "chat": {"id": 1, "type": "private"}
            }
        }));
        assert_eq!(author_id(&system), None);
    }
}
