// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! A `tracing_subscriber::Layer` that captures log records into a bounded
//! in-memory ring and a broadcast channel.
//!
//! `logs` subscriptions are fed live from the broadcast side; the ring
//! serves `includeRecent` backfill.  The layer never blocks the caller —
//! lagged subscribers simply miss entries (log subscriptions are
//! drop-oldest by contract).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// One captured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub level: String,
    /// Tracing target, e.g. `tomte_channels::telegram`.
    pub component: String,
    pub message: String,
}

/// Filter shape accepted by `subscribe("logs", …)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilter {
    /// Minimum severity ("trace" | "debug" | "info" | "warn" | "error").
    pub level: Option<String>,
    /// Component prefix match.
    pub component: Option<String>,
    /// Only records at or after this timestamp (ms).
    pub since: Option<i64>,
    /// Cap on backfilled records.
    pub limit: Option<usize>,
    /// Backfill buffered records on subscribe.
    #[serde(default, alias = "includeRecent")]
    pub include_recent: bool,
}

fn level_rank(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "trace" => 0,
        "debug" => 1,
        "info" => 2,
        "warn" => 3,
        "error" => 4,
        _ => 2,
    }
}

impl LogFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(min) = &self.level {
            if level_rank(&record.level) < level_rank(min) {
                return false;
            }
        }
        if let Some(prefix) = &self.component {
            if !record.component.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        true
    }
}

pub struct LogBuffer {
    ring: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    tx: broadcast::Sender<LogRecord>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Arc::new(Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            tx,
        })
    }

    pub fn push(&self, record: LogRecord) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(record);
    }

    /// Buffered records matching `filter`, oldest first, capped at
    /// `filter.limit`.
    pub fn recent(&self, filter: &LogFilter) -> Vec<LogRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<LogRecord> = ring.iter().filter(|r| filter.matches(r)).cloned().collect();
        match filter.limit {
            Some(limit) if matching.len() > limit => {
                matching[matching.len() - limit..].to_vec()
            }
            _ => matching,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }
}

/// The tracing layer feeding a [`LogBuffer`].
pub struct LogCaptureLayer {
    buffer: Arc<LogBuffer>,
}

impl LogCaptureLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        self.buffer.push(LogRecord {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level: meta.level().to_string(),
            component: meta.target().to_string(),
            message: visitor.0,
        });
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(", {}={:?}", field.name(), value));
        } else {
            self.0 = format!("{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(", {}={}", field.name(), value));
        } else {
            self.0 = format!("{}={}", field.name(), value);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: &str, component: &str, ts: i64) -> LogRecord {
        LogRecord {
            timestamp: ts,
            level: level.to_string(),
            component: component.to_string(),
            message: "m".to_string(),
        }
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let buffer = LogBuffer::new(2);
        buffer.push(record("INFO", "a", 1));
        buffer.push(record("INFO", "b", 2));
        buffer.push(record("INFO", "c", 3));

        let all = buffer.recent(&LogFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].component, "b");
        assert_eq!(all[1].component, "c");
    }

    #[test]
    fn filter_by_minimum_level() {
        let filter = LogFilter {
            level: Some("warn".into()),
            ..Default::default()
        };
        assert!(filter.matches(&record("ERROR", "x", 0)));
        assert!(filter.matches(&record("WARN", "x", 0)));
        assert!(!filter.matches(&record("INFO", "x", 0)));
    }

    #[test]
    fn filter_by_component_prefix_and_since() {
        let filter = LogFilter {
            component: Some("tomte_channels".into()),
            since: Some(100),
            ..Default::default()
        };
        assert!(filter.matches(&record("INFO", "tomte_channels::telegram", 150)));
        assert!(!filter.matches(&record("INFO", "tomte_agent", 150)));
        assert!(!filter.matches(&record("INFO", "tomte_channels", 50)));
    }

    #[test]
    fn recent_applies_limit_keeping_newest() {
        let buffer = LogBuffer::new(10);
        for i in 0..5 {
            buffer.push(record("INFO", "c", i));
        }
        let filter = LogFilter {
            limit: Some(2),
            ..Default::default()
        };
        let out = buffer.recent(&filter);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 3);
        assert_eq!(out[1].timestamp, 4);
    }

    #[tokio::test]
    async fn broadcast_side_delivers_live_records() {
        let buffer = LogBuffer::new(8);
        let mut rx = buffer.subscribe();
        buffer.push(record("INFO", "live", 1));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.component, "live");
    }

    #[test]
    fn include_recent_accepts_camel_case_alias() {
        let filter: LogFilter = serde_json::from_str(r#"{"includeRecent": true}"#).unwrap();
        assert!(filter.include_recent);
    }
}
