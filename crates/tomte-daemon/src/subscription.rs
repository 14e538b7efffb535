// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-connection subscription bookkeeping.
//!
//! A subscription binds a connection to one notification stream with an
//! optional type-specific filter.  Ids are server-generated and valid only
//! on the issuing connection; everything dies with the connection and
//! nothing survives a daemon restart.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logbuf::LogFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionType {
    #[serde(rename = "logs")]
    Logs,
    #[serde(rename = "agent.output")]
    AgentOutput,
    #[serde(rename = "events.channel")]
    ChannelEvents,
    #[serde(rename = "events.lifecycle")]
    LifecycleEvents,
}

impl SubscriptionType {
    /// Method string used on notification frames for this stream.
    pub fn notification_method(&self) -> &'static str {
        match self {
            Self::Logs => "log",
            Self::AgentOutput => "agent.output",
            Self::ChannelEvents => "event.channel",
            Self::LifecycleEvents => "event.lifecycle",
        }
    }
}

/// Filter shape for `agent.output` subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutputFilter {
    /// Restrict to one session; unset receives every session's output.
    #[serde(default, alias = "agentId")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub sub_type: SubscriptionType,
    pub log_filter: LogFilter,
    pub agent_filter: AgentOutputFilter,
}

impl Subscription {
    pub fn wants_agent(&self, agent_id: &str) -> bool {
        match &self.agent_filter.agent_id {
            Some(wanted) => wanted == agent_id,
            None => true,
        }
    }
}

/// The subscriptions of one connection.
#[derive(Default)]
pub struct SubscriptionSet {
    subs: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        sub_type: SubscriptionType,
        log_filter: LogFilter,
        agent_filter: AgentOutputFilter,
    ) -> String {
        let id = format!("sub-{}", Uuid::new_v4());
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                sub_type,
                log_filter,
                agent_filter,
            },
        );
        id
    }

    /// Idempotent; unknown and foreign ids succeed silently.
    pub fn remove(&self, id: &str) {
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.remove(id);
    }

    pub fn matching(&self, sub_type: SubscriptionType) -> Vec<Subscription> {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.values()
            .filter(|s| s.sub_type == sub_type)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.subs.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.subs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_type_parses_wire_names() {
        let t: SubscriptionType = serde_json::from_str("\"agent.output\"").unwrap();
        assert_eq!(t, SubscriptionType::AgentOutput);
        assert_eq!(t.notification_method(), "agent.output");

        let t: SubscriptionType = serde_json::from_str("\"events.channel\"").unwrap();
        assert_eq!(t.notification_method(), "event.channel");
    }

    #[test]
    fn add_and_match_by_type() {
        let set = SubscriptionSet::new();
        let id = set.add(
            SubscriptionType::Logs,
            LogFilter::default(),
            AgentOutputFilter::default(),
        );
        assert!(id.starts_with("sub-"));
        assert_eq!(set.matching(SubscriptionType::Logs).len(), 1);
        assert!(set.matching(SubscriptionType::AgentOutput).is_empty());
    }

    #[test]
    fn remove_is_idempotent_for_unknown_ids() {
        let set = SubscriptionSet::new();
        set.remove("sub-nope");
        let id = set.add(
            SubscriptionType::Logs,
            LogFilter::default(),
            AgentOutputFilter::default(),
        );
        set.remove(&id);
        set.remove(&id);
        assert!(set.is_empty());
    }

    #[test]
    fn agent_filter_restricts_by_id() {
        let set = SubscriptionSet::new();
        set.add(
            SubscriptionType::AgentOutput,
            LogFilter::default(),
            AgentOutputFilter {
                agent_id: Some("a-1".into()),
            },
        );
        let subs = set.matching(SubscriptionType::AgentOutput);
        assert!(subs[0].wants_agent("a-1"));
        assert!(!subs[0].wants_agent("a-2"));
    }

    #[test]
    fn agent_filter_accepts_camel_case_alias() {
        let f: AgentOutputFilter = serde_json::from_str(r#"{"agentId": "x"}"#).unwrap();
        assert_eq!(f.agent_id.as_deref(), Some("x"));
    }
}
