// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Daemon assembly: configuration in, running control socket out.
//!
//! The binary constructs a [`Daemon`], optionally registers extra adapters
//! and tools, and calls [`Daemon::run`], which blocks until shutdown.
//! There is no process-global state; everything threads through the
//! construction context.

use std::path::PathBuf;
use std::sync::Arc;

use tomte_agent::ToolRegistry;
use tomte_config::Config;

use crate::logbuf::LogBuffer;
use crate::server;
use crate::service::DaemonService;

pub struct Daemon {
    service: Arc<DaemonService>,
    socket_path: PathBuf,
}

impl Daemon {
    /// Assemble a daemon.  `log_buffer` must be the same buffer whose
    /// capture layer was installed in the tracing subscriber, so that
    /// `logs` subscriptions see the process's log stream.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        socket_path: PathBuf,
        log_buffer: Arc<LogBuffer>,
        tools: ToolRegistry,
    ) -> Self {
        let service = DaemonService::new(config, config_path, log_buffer, tools);
        Self {
            service,
            socket_path,
        }
    }

    pub fn service(&self) -> &Arc<DaemonService> {
        &self.service
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Start channels, scheduler, and pumps, then serve the control socket
    /// until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.service.start().await?;
        server::serve(&self.socket_path, self.service.clone()).await
    }
}
