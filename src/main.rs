// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use tomte_agent::ToolRegistry;
use tomte_daemon::{Daemon, LogBuffer, LogCaptureLayer};

enum RunError {
    /// Bad config, unresolvable socket, bind failure.  Exit code 1.
    Startup(anyhow::Error),
    /// The daemon died after startup.  Exit code 2.
    Fatal(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Startup(e)) => {
            eprintln!("tomte: startup failed: {e:#}");
            ExitCode::from(1)
        }
        Err(RunError::Fatal(e)) => {
            eprintln!("tomte: fatal error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let config = tomte_config::load(cli.config.as_deref()).map_err(RunError::Startup)?;

    let problems = tomte_config::validate(&config);
    if !problems.is_empty() {
        return Err(RunError::Startup(anyhow::anyhow!(
            "invalid configuration:\n  {}",
            problems.join("\n  ")
        )));
    }
    if cli.check {
        println!("configuration OK");
        return Ok(());
    }

    // The capture layer feeds the daemon's `logs` subscriptions; the fmt
    // layer keeps stderr output for local debugging.
    let log_buffer = LogBuffer::new(config.daemon.log_buffer);
    tracing_subscriber::registry()
        .with(EnvFilter::new(&cli.log))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(LogCaptureLayer::new(log_buffer.clone()))
        .init();

    let socket_path =
        tomte_config::resolve_socket_path(cli.socket.as_deref(), config.daemon.socket.as_deref());

    let daemon = Daemon::new(
        config,
        cli.config.clone(),
        socket_path,
        log_buffer,
        ToolRegistry::new(),
    );

    // Panics inside the daemon (acceptor, scheduler) surface here as a
    // join error rather than killing the process silently.
    let handle = tokio::spawn(async move { daemon.run().await });
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RunError::Startup(e)),
        Err(join_error) => Err(RunError::Fatal(anyhow::anyhow!(
            "daemon task failed: {join_error}"
        ))),
    }
}
