// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Conversation bindings: destination ↔ session.
//!
//! Inbound events whose destination is bound route to the bound session;
//! session output routes back out to the bound destination.  Bindings are
//! process-local (no persistence, one host).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tomte_agent::SessionId;
use tomte_channels::Destination;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationBinding {
    pub key: String,
    pub destination: Destination,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// The binding key: channel id plus the adapter's opaque ref.
pub fn conversation_key(destination: &Destination) -> String {
    format!("{}/{}", destination.channel_id, destination.r#ref)
}

#[derive(Default)]
pub struct ConversationStore {
    bindings: Mutex<HashMap<String, ConversationBinding>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, destination: Destination, session_id: SessionId) -> ConversationBinding {
        let key = conversation_key(&destination);
        let now = Utc::now();
        let binding = ConversationBinding {
            key: key.clone(),
            destination,
            session_id,
            created_at: now,
            last_activity: now,
        };
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, binding.clone());
        binding
    }

    pub fn get(&self, key: &str) -> Option<ConversationBinding> {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn list(&self) -> Vec<ConversationBinding> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ConversationBinding> = bindings.values().cloned().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    /// Returns `true` when a binding was removed.
    pub fn unbind(&self, key: &str) -> bool {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    /// Drop every binding pointing at `session_id`.
    pub fn unbind_session(&self, session_id: &SessionId) {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, b| &b.session_id != session_id);
    }

    pub fn session_for(&self, destination: &Destination) -> Option<SessionId> {
        let key = conversation_key(destination);
        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(binding) = bindings.get_mut(&key) {
            binding.last_activity = Utc::now();
            return Some(binding.session_id.clone());
        }
        None
    }

    pub fn destination_for(&self, session_id: &SessionId) -> Option<Destination> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings
            .values()
            .find(|b| &b.session_id == session_id)
            .map(|b| b.destination.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tomte_channels::{ChannelId, ConversationType, DestinationMeta};

    use super::*;

    fn destination(channel: &str, r#ref: &str) -> Destination {
        Destination {
            channel_id: ChannelId::from(channel),
            r#ref: r#ref.to_string(),
            metadata: DestinationMeta {
                conversation_type: ConversationType::Direct,
                title: None,
                participant_count: None,
                platform_data: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn bind_and_lookup_both_directions() {
        let store = ConversationStore::new();
        let dest = destination("ch-1", "7::");
        let session = SessionId::from("s-1");
        store.bind(dest.clone(), session.clone());

        assert_eq!(store.session_for(&dest), Some(session.clone()));
        assert_eq!(store.destination_for(&session).unwrap().r#ref, "7::");
    }

    #[test]
    fn unbind_removes_the_binding() {
        let store = ConversationStore::new();
        let dest = destination("ch-1", "7::");
        let binding = store.bind(dest.clone(), SessionId::from("s-1"));

        assert!(store.unbind(&binding.key));
        assert!(!store.unbind(&binding.key));
        assert!(store.session_for(&dest).is_none());
    }

    #[test]
    fn unbind_session_clears_all_its_bindings() {
        let store = ConversationStore::new();
        let session = SessionId::from("s-1");
        store.bind(destination("ch-1", "1::"), session.clone());
        store.bind(destination("ch-1", "2::"), session.clone());
        store.bind(destination("ch-1", "3::"), SessionId::from("s-2"));

        store.unbind_session(&session);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn keys_are_channel_scoped() {
        let a = conversation_key(&destination("ch-1", "7::"));
        let b = conversation_key(&destination("ch-2", "7::"));
        assert_ne!(a, b);
    }
}
