// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The tomte control-plane daemon: newline-delimited JSON-RPC over a local
//! Unix socket, typed pub/sub subscriptions, and the wiring between
//! channels, agent sessions, conversations, and the scheduler.

pub mod connection;
pub mod conversations;
mod daemon;
mod error;
pub mod framing;
pub mod logbuf;
pub mod protocol;
mod server;
pub mod service;
pub mod subscription;

pub use daemon::Daemon;
pub use error::DaemonError;
pub use logbuf::{LogBuffer, LogCaptureLayer, LogFilter, LogRecord};
pub use protocol::{classify, codes, Envelope, Frame, RpcError};
pub use service::{AdapterFactory, ChannelFactory, DaemonService, VERSION};
pub use subscription::{AgentOutputFilter, Subscription, SubscriptionSet, SubscriptionType};
