// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use crate::protocol::{codes, RpcError};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    RequestTimeout,

    #[error("unknown method: {0}")]
    MethodUnknown(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Channel(#[from] tomte_channels::ChannelError),

    #[error(transparent)]
    Agent(#[from] tomte_agent::AgentError),

    #[error(transparent)]
    Scheduler(#[from] tomte_scheduler::SchedulerError),
}

impl DaemonError {
    pub fn code(&self) -> i64 {
        use tomte_agent::AgentError;
        use tomte_channels::ChannelError;
        use tomte_scheduler::SchedulerError;

        match self {
            Self::NotConnected => codes::NOT_CONNECTED,
            Self::RequestTimeout => codes::REQUEST_TIMEOUT,
            Self::MethodUnknown(_) => codes::METHOD_UNKNOWN,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::ShutdownInProgress => codes::SHUTDOWN_IN_PROGRESS,
            Self::ConfigInvalid(_) => codes::CONFIG_INVALID,
            Self::Channel(e) => match e {
                ChannelError::NotFound(_) => codes::CHANNEL_NOT_FOUND,
                ChannelError::Duplicate(_) => codes::CHANNEL_DUPLICATE,
                ChannelError::InvalidState(_) => codes::CHANNEL_STATE_INVALID,
                ChannelError::InvalidRef(_) => codes::INVALID_PARAMS,
                ChannelError::Api { .. }
                | ChannelError::Transport(_)
                | ChannelError::Unsupported(_)
                | ChannelError::Media(_)
                | ChannelError::Simulated(_) => codes::ADAPTER_API_ERROR,
            },
            Self::Agent(e) => match e {
                AgentError::NotFound(_) => codes::AGENT_NOT_FOUND,
                AgentError::InvalidState(_) => codes::AGENT_STATE_INVALID,
                AgentError::AdapterMismatch { .. } => codes::AGENT_ADAPTER_MISMATCH,
                AgentError::Adapter(_) => codes::ADAPTER_API_ERROR,
            },
            Self::Scheduler(e) => match e {
                SchedulerError::UnknownJob(_) => codes::INVALID_PARAMS,
                SchedulerError::DuplicateJob(_) | SchedulerError::InvalidSchedule { .. } => {
                    codes::CONFIG_INVALID
                }
            },
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        // The platform's own error code survives as structured context.
        let data = match self {
            Self::Channel(tomte_channels::ChannelError::Api { code, .. }) => {
                Some(serde_json::json!({ "platform_code": code }))
            }
            _ => None,
        };
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_map_to_their_codes() {
        let not_found =
            DaemonError::Channel(tomte_channels::ChannelError::NotFound("x".into()));
        assert_eq!(not_found.code(), codes::CHANNEL_NOT_FOUND);

        let dup = DaemonError::Channel(tomte_channels::ChannelError::Duplicate("x".into()));
        assert_eq!(dup.code(), codes::CHANNEL_DUPLICATE);
    }

    #[test]
    fn api_errors_carry_platform_code_as_data() {
        let err = DaemonError::Channel(tomte_channels::ChannelError::Api {
            code: 429,
            description: "Too Many Requests".into(),
        });
        let rpc = err.to_rpc();
        assert_eq!(rpc.code, codes::ADAPTER_API_ERROR);
        assert!(rpc.message.contains("429"));
        assert!(rpc.message.contains("Too Many Requests"));
        assert_eq!(rpc.data.unwrap()["platform_code"], 429);
    }

    #[test]
    fn adapter_mismatch_maps_to_its_code() {
        let err = DaemonError::Agent(tomte_agent::AgentError::AdapterMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        assert_eq!(err.code(), codes::AGENT_ADAPTER_MISMATCH);
    }
}
