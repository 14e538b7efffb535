// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub agent: AgentDefaults,
    /// Channel instances to build at startup.
    ///
    /// ```yaml
    /// channels:
    ///   - adapter: telegram
    ///     token_env: TELEGRAM_BOT_TOKEN
    ///     allowed_users: [123456789]
    ///   - adapter: mock
    ///     id: test-channel
    /// ```
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Explicit socket path.  When unset the path is resolved from
    /// `TOMTE_SOCKET`, `XDG_RUNTIME_DIR`, or `/tmp` (in that order of
    /// discovery; a `--socket` CLI flag wins over all of them).
    pub socket: Option<PathBuf>,
    /// Per-request deadline.  The server finishes handlers past the deadline
    /// but answers the caller with a timeout error.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Capacity of the per-connection notification outbox.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// Number of recent log records kept for `includeRecent` subscriptions.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_log_buffer() -> usize {
    1024
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            request_timeout: default_request_timeout(),
            outbox_capacity: default_outbox_capacity(),
            log_buffer: default_log_buffer(),
        }
    }
}

/// Defaults applied to every spawned agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Adapter name used when `agent.spawn` does not name one.
    #[serde(default = "default_adapter")]
    pub adapter: String,
    /// Model identifier forwarded to the adapter.
    pub model: Option<String>,
    /// Timezone label rendered by the datetime injector (e.g. "UTC", "CET").
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Path to the operator guidance file recorded in checkpoints.
    pub guidance_path: Option<PathBuf>,
    /// Spawn a session automatically when an inbound message arrives on a
    /// destination with no conversation binding.
    #[serde(default = "default_true")]
    pub auto_spawn: bool,
    #[serde(default)]
    pub pulse: PulseConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
}

fn default_adapter() -> String {
    "mock".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            model: None,
            timezone: default_timezone(),
            guidance_path: None,
            auto_spawn: true,
            pulse: PulseConfig::default(),
            skills: SkillsConfig::default(),
        }
    }
}

/// Settings for the pulse injector (periodic self-prompt sessions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    /// File whose contents are injected into pulse sessions.
    pub file: Option<PathBuf>,
    /// When true pulse sessions are instructed to stay silent unless they
    /// have something actionable to say.
    #[serde(default)]
    pub silent: bool,
}

/// Settings for the skills injector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directories scanned for `SKILL.md` manifests.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
}

/// One channel instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stable channel id.  Generated when omitted.
    pub id: Option<String>,
    /// Adapter name: "telegram" or "mock".
    pub adapter: String,
    /// Bot token.  Prefer `token_env` in version-controlled files.
    pub token: Option<String>,
    /// Environment variable holding the bot token (read at startup).
    pub token_env: Option<String>,
    /// API base URL override (e.g. a local bot API server).
    pub base_url: Option<String>,
    /// Long-poll timeout.
    #[serde(default = "default_polling_timeout", with = "humantime_serde")]
    pub polling_timeout: Duration,
    /// Update types requested from the platform.  Unset requests the
    /// platform default set.
    pub allowed_updates: Option<Vec<String>>,
    /// Author ids admitted by the allowlist filter.  Empty permits all.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Connect this channel at daemon startup.
    #[serde(default = "default_true")]
    pub autoconnect: bool,
}

fn default_polling_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ChannelConfig {
    /// Resolve the bot token: explicit value wins, then `token_env`.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(t) = &self.token {
            return Some(t.clone());
        }
        if let Some(var) = &self.token_env {
            return std::env::var(var).ok();
        }
        None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// A named cron job.  On fire the daemon spawns a pulse session with the
/// configured task as its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Cron expression (seconds field included, `cron` crate grammar).
    pub schedule: String,
    /// Input text handed to the pulse session.
    pub task: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Duration fields serialised as humantime strings ("30s", "5m").
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Validate a loaded config, returning one message per problem found.
///
/// An empty vector means the config is valid.  Used by `config.validate`
/// and by the onboarding status report.
pub fn validate(config: &Config) -> Vec<String> {
    let mut problems = Vec::new();

    for (i, ch) in config.channels.iter().enumerate() {
        match ch.adapter.as_str() {
            "telegram" => {
                if ch.resolve_token().is_none() {
                    problems.push(format!(
                        "channels[{i}]: telegram adapter requires token or token_env"
                    ));
                }
            }
            "mock" => {}
            other => problems.push(format!("channels[{i}]: unknown adapter \"{other}\"")),
        }
        if ch.polling_timeout.as_secs() == 0 {
            problems.push(format!("channels[{i}]: polling_timeout must be non-zero"));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for job in &config.scheduler.jobs {
        if !seen.insert(job.name.as_str()) {
            problems.push(format!("scheduler: duplicate job name \"{}\"", job.name));
        }
        if job.schedule.trim().is_empty() {
            problems.push(format!("scheduler job \"{}\": empty schedule", job.name));
        }
    }

    if config.daemon.outbox_capacity == 0 {
        problems.push("daemon.outbox_capacity must be at least 1".to_string());
    }

    problems
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
