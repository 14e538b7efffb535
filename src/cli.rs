// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// The tomte daemon: runs autonomous agents across messaging channels and
/// serves the control socket operators talk to.
#[derive(Debug, Parser)]
#[command(name = "tomte", version, about)]
pub struct Cli {
    /// Control socket path.  Wins over TOMTE_SOCKET and the config file.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Explicit config file, merged over the discovered layers.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter directive, e.g. "info" or "tomte_daemon=debug".
    #[arg(long, default_value = "info", env = "TOMTE_LOG")]
    pub log: String,

    /// Validate the configuration and exit without starting the daemon.
    #[arg(long)]
    pub check: bool,
}
