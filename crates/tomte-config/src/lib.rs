// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;
mod socket;

pub use loader::load;
pub use schema::{
    validate, AgentDefaults, ChannelConfig, Config, DaemonConfig, JobConfig, PulseConfig,
    SchedulerConfig, SkillsConfig,
};
pub use socket::{resolve_socket_path, SOCKET_ENV_VAR};
