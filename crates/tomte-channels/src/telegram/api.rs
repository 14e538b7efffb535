// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Thin Telegram Bot API client.
//!
//! Every call POSTs JSON to `<base>/bot<token>/<method>` and unwraps the
//! standard `{ok, result, description, error_code}` envelope.  Well-formed
//! API failures surface both the description and the numeric code; anything
//! else (connection refused, malformed body) is a transport error.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use crate::error::ChannelError;

pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

// ── Wire types (subset of the Bot API we consume) ─────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub edited_message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
    pub my_chat_member: Option<ChatMemberUpdated>,
    pub message_reaction: Option<MessageReactionUpdated>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub date: i64,
    pub message_thread_id: Option<i64>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Option<Vec<PhotoSize>>,
    pub video: Option<Video>,
    pub audio: Option<Audio>,
    pub voice: Option<Voice>,
    pub document: Option<Document>,
    pub animation: Option<Animation>,
    pub location: Option<Location>,
    pub contact: Option<Contact>,
    pub sticker: Option<Sticker>,
    pub new_chat_members: Option<Vec<User>>,
    pub left_chat_member: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    pub username: Option<String>,
    pub is_forum: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Audio {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Animation {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    pub phone_number: String,
    pub first_name: String,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sticker {
    pub file_id: String,
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: Option<User>,
    pub date: Option<i64>,
    pub old_chat_member: ChatMember,
    pub new_chat_member: ChatMember,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMember {
    pub status: String,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageReactionUpdated {
    pub chat: Chat,
    pub message_id: i64,
    pub user: Option<User>,
    pub date: i64,
    pub old_reaction: Vec<Reaction>,
    pub new_reaction: Vec<Reaction>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    #[serde(rename = "type")]
    pub kind: String,
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiFile {
    pub file_id: String,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct BotApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl BotApi {
    pub fn new(token: String, base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// POST a method call and unwrap the API envelope.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, ChannelError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, params, None).await
    }

    async fn call_with_timeout<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<R, ChannelError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        trace!(method, "telegram api call");
        let mut req = self.http.post(self.method_url(method)).json(params);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("{method}: {e}")))?;
        let envelope: ApiEnvelope<R> = resp
            .json()
            .await
            .map_err(|e| ChannelError::Transport(format!("{method}: invalid response: {e}")))?;

        if !envelope.ok {
            return Err(ChannelError::Api {
                code: envelope.error_code.unwrap_or(0),
                description: envelope
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        envelope
            .result
            .ok_or_else(|| ChannelError::Transport(format!("{method}: ok response without result")))
    }

    pub async fn get_me(&self) -> Result<Me, ChannelError> {
        self.call("getMe", &json!({})).await
    }

    /// Long poll for updates.  The HTTP timeout is padded past the poll
    /// timeout so the server side expires first.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout: Duration,
        allowed_updates: Option<&[String]>,
    ) -> Result<Vec<Update>, ChannelError> {
        let mut params = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
        });
        if let Some(allowed) = allowed_updates {
            params["allowed_updates"] = json!(allowed);
        }
        self.call_with_timeout("getUpdates", &params, Some(timeout + Duration::from_secs(10)))
            .await
    }

    pub async fn send_chat_action(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        action: &str,
    ) -> Result<bool, ChannelError> {
        let mut params = json!({ "chat_id": chat_id, "action": action });
        if let Some(t) = thread_id {
            params["message_thread_id"] = json!(t);
        }
        self.call("sendChatAction", &params).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
        parse_mode: Option<&str>,
        reply_to_message_id: Option<i64>,
    ) -> Result<Message, ChannelError> {
        let mut params = json!({ "chat_id": chat_id, "text": text });
        if let Some(t) = thread_id {
            params["message_thread_id"] = json!(t);
        }
        if let Some(mode) = parse_mode {
            params["parse_mode"] = json!(mode);
        }
        if let Some(reply) = reply_to_message_id {
            params["reply_to_message_id"] = json!(reply);
        }
        self.call("sendMessage", &params).await
    }

    /// Dispatch a media message by URL.  `method`/`field` pairs come from
    /// the media kind (`sendPhoto`/`photo`, `sendVideo`/`video`, …).
    #[allow(clippy::too_many_arguments)]
    pub async fn send_media_url(
        &self,
        method: &str,
        field: &str,
        chat_id: i64,
        thread_id: Option<i64>,
        url: &str,
        caption: Option<&str>,
        reply_to_message_id: Option<i64>,
    ) -> Result<Message, ChannelError> {
        let mut params = json!({ "chat_id": chat_id, field: url });
        if let Some(t) = thread_id {
            params["message_thread_id"] = json!(t);
        }
        if let Some(c) = caption {
            params["caption"] = json!(c);
        }
        if let Some(reply) = reply_to_message_id {
            params["reply_to_message_id"] = json!(reply);
        }
        self.call(method, &params).await
    }

    pub async fn send_location(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        lat: f64,
        lng: f64,
    ) -> Result<Message, ChannelError> {
        let mut params = json!({ "chat_id": chat_id, "latitude": lat, "longitude": lng });
        if let Some(t) = thread_id {
            params["message_thread_id"] = json!(t);
        }
        self.call("sendLocation", &params).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<ApiFile, ChannelError> {
        self.call("getFile", &json!({ "file_id": file_id })).await
    }

    /// Stream the bytes behind a `file_path` obtained from [`get_file`].
    pub async fn download_file(&self, file_path: &str) -> Result<reqwest::Response, ChannelError> {
        let url = format!("{}/file/bot{}/{}", self.base_url, self.token, file_path);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(format!("file download: {e}")))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Media(format!(
                "file download failed with status {}",
                resp.status()
            )));
        }
        Ok(resp)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_decodes_a_plain_message() {
        let raw = serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 77,
                "text": "hello",
                "date": 1700000000,
                "chat": {"id": -200, "type": "group", "title": "G"},
                "from": {"id": 888, "is_bot": false, "first_name": "Alice", "username": "alice"}
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.text.as_deref(), Some("hello"));
        assert_eq!(msg.chat.id, -200);
        assert_eq!(msg.from.unwrap().username.as_deref(), Some("alice"));
    }

    #[test]
    fn envelope_failure_carries_code_and_description() {
        let raw = r#"{"ok": false, "description": "Unauthorized", "error_code": 401}"#;
        let envelope: ApiEnvelope<Vec<Update>> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.error_code, Some(401));
        assert_eq!(envelope.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn unknown_update_fields_are_ignored() {
        let raw = serde_json::json!({
            "update_id": 9,
            "shipping_query": {"id": "x"}
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        assert!(update.message.is_none());
        assert!(update.callback_query.is_none());
    }

    #[test]
    fn method_url_embeds_token() {
        let api = BotApi::new("123:abc".into(), None);
        assert_eq!(
            api.method_url("getMe"),
            "https://api.telegram.org/bot123:abc/getMe"
        );
    }
}
