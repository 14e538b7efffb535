// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Unix socket acceptor.
//!
//! One listener, one `serve` task per accepted client.  The accept loop
//! runs until the service signals shutdown.  A stale socket file from a
//! previous run is removed before binding; a bind failure is a startup
//! error (exit code 1 territory).

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::connection;
use crate::service::DaemonService;

pub async fn serve(socket_path: &Path, service: Arc<DaemonService>) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding control socket {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "control socket listening");

    let mut shutdown = service.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let id = service.next_connection_id();
                    tokio::spawn(connection::serve(stream, id, service.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("control socket closed");
    Ok(())
}
