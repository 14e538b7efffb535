// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire protocol between control clients and the daemon.
//!
//! Every frame is one JSON object per line.  Message kind is decided by
//! shape, not by a kind field:
//!
//! - `{id, method, params?}` — request
//! - `{id, result?}` / `{id, error}` — response
//! - `{method, params?}` — notification (no `id`)
//!
//! Responses correlate to requests by `id` on the originating connection.
//! Error codes are drawn from [`codes`].

use serde::{Deserialize, Serialize};

/// Integer error codes for the response envelope.
pub mod codes {
    /// Handler panic or other unexpected server-side failure.
    pub const INTERNAL: i64 = 1000;
    pub const NOT_CONNECTED: i64 = 1001;
    pub const REQUEST_TIMEOUT: i64 = 1002;
    pub const METHOD_UNKNOWN: i64 = 1003;
    pub const INVALID_PARAMS: i64 = 1004;
    pub const SHUTDOWN_IN_PROGRESS: i64 = 1005;

    pub const CHANNEL_NOT_FOUND: i64 = 2001;
    pub const CHANNEL_DUPLICATE: i64 = 2002;
    pub const CHANNEL_STATE_INVALID: i64 = 2003;
    pub const ADAPTER_API_ERROR: i64 = 2004;

    pub const AGENT_NOT_FOUND: i64 = 3001;
    pub const AGENT_STATE_INVALID: i64 = 3002;
    pub const AGENT_ADAPTER_MISMATCH: i64 = 3003;

    pub const SUBSCRIPTION_UNKNOWN: i64 = 4001;

    pub const DUPLICATE_STEP: i64 = 5001;
    /// Internal suspension marker; must never cross the wire.
    pub const SUSPENDED: i64 = 5002;

    pub const CONFIG_INVALID: i64 = 6001;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Raw wire envelope.  Exactly one of the shapes above; [`classify`] sorts
/// out which.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Envelope {
    pub fn response_ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn response_err(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Default::default()
        }
    }
}

/// A classified frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: String,
        method: String,
        params: serde_json::Value,
    },
    Response {
        id: String,
        result: Option<serde_json::Value>,
        error: Option<RpcError>,
    },
    Notification {
        method: String,
        params: serde_json::Value,
    },
}

/// Routing rule: `id` present → request or response; otherwise notification.
/// Returns `None` for envelopes that are neither (no id, no method).
pub fn classify(envelope: Envelope) -> Option<Frame> {
    match (envelope.id, envelope.method) {
        (Some(id), Some(method)) => Some(Frame::Request {
            id,
            method,
            params: envelope.params.unwrap_or(serde_json::Value::Null),
        }),
        (Some(id), None) => Some(Frame::Response {
            id,
            result: envelope.result,
            error: envelope.error,
        }),
        (None, Some(method)) => Some(Frame::Notification {
            method,
            params: envelope.params.unwrap_or(serde_json::Value::Null),
        }),
        (None, None) => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_classification() {
        let env: Envelope =
            serde_json::from_str(r#"{"id":"r-1","method":"daemon.ping"}"#).unwrap();
        match classify(env).unwrap() {
            Frame::Request { id, method, params } => {
                assert_eq!(id, "r-1");
                assert_eq!(method, "daemon.ping");
                assert!(params.is_null());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_classification() {
        let env: Envelope =
            serde_json::from_str(r#"{"id":"r-1","result":{"pong":true}}"#).unwrap();
        assert!(matches!(classify(env), Some(Frame::Response { .. })));
    }

    #[test]
    fn notification_classification() {
        let env: Envelope =
            serde_json::from_str(r#"{"method":"log","params":{"level":"info"}}"#).unwrap();
        assert!(matches!(classify(env), Some(Frame::Notification { .. })));
    }

    #[test]
    fn shapeless_envelope_is_rejected() {
        let env: Envelope = serde_json::from_str(r#"{"result":{}}"#).unwrap();
        assert!(classify(env).is_none());
    }

    #[test]
    fn response_serialisation_omits_absent_fields() {
        let env = Envelope::response_ok("r-1", serde_json::json!({"pong": true}));
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"id":"r-1","result":{"pong":true}}"#);
    }

    #[test]
    fn error_envelope_round_trip() {
        let env = Envelope::response_err(
            "r-2",
            RpcError {
                code: codes::METHOD_UNKNOWN,
                message: "unknown method: daemon.dance".into(),
                data: None,
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error.unwrap().code, codes::METHOD_UNKNOWN);
    }
}
