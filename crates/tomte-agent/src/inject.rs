// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Context injectors: an ordered pipeline that contributes system-prompt
//! fragments and resume messages to every new or resumed session.
//!
//! An injector that fails (or whose optional file is missing) contributes
//! nothing; the pipeline logs and moves on.  Contributions concatenate in
//! declared order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::adapter::ChatMessage;
use crate::session::SessionId;

/// Inputs available to every injector.
#[derive(Debug, Clone)]
pub struct InjectorContext {
    /// Timezone label rendered into timestamps ("UTC", "CET").
    pub timezone: String,
    pub now: DateTime<Utc>,
    pub session_id: SessionId,
    pub guidance_path: Option<PathBuf>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait ContextInjector: Send + Sync {
    fn name(&self) -> &str;

    /// Fragment appended to the adapter's system prompt.
    async fn inject_system_context(
        &self,
        _ctx: &InjectorContext,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Messages appended to the history before the next turn of a resumed
    /// session.
    async fn inject_resume_context(
        &self,
        _ctx: &InjectorContext,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
}

/// Ordered injector pipeline.
#[derive(Default)]
pub struct InjectorPipeline {
    injectors: Vec<Arc<dyn ContextInjector>>,
}

impl InjectorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline: datetime, pulse, skills (in that order).
    pub fn standard(defaults: &tomte_config::AgentDefaults) -> Self {
        let mut pipeline = Self::new();
        pipeline.push(DatetimeInjector);
        pipeline.push(PulseInjector {
            file: defaults.pulse.file.clone(),
            silent: defaults.pulse.silent,
        });
        pipeline.push(SkillsInjector {
            dirs: defaults.skills.dirs.clone(),
        });
        pipeline
    }

    pub fn push(&mut self, injector: impl ContextInjector + 'static) {
        self.injectors.push(Arc::new(injector));
    }

    pub fn names(&self) -> Vec<String> {
        self.injectors.iter().map(|i| i.name().to_string()).collect()
    }

    /// Concatenated system-prompt fragments, in declared order.
    pub async fn system_context(&self, ctx: &InjectorContext) -> String {
        let mut fragments = Vec::new();
        for injector in &self.injectors {
            match injector.inject_system_context(ctx).await {
                Ok(Some(fragment)) if !fragment.is_empty() => fragments.push(fragment),
                Ok(_) => {}
                Err(e) => warn!(injector = injector.name(), error = %e, "system injector failed"),
            }
        }
        fragments.join("\n\n")
    }

    /// Resume messages, in declared order.
    pub async fn resume_context(&self, ctx: &InjectorContext) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for injector in &self.injectors {
            match injector.inject_resume_context(ctx).await {
                Ok(more) => messages.extend(more),
                Err(e) => warn!(injector = injector.name(), error = %e, "resume injector failed"),
            }
        }
        messages
    }
}

// ── Datetime injector ─────────────────────────────────────────────────────────

/// Renders a fixed human-readable timestamp with the timezone label for both
/// hooks.
pub struct DatetimeInjector;

fn render_timestamp(ctx: &InjectorContext) -> String {
    format!(
        "{} ({})",
        ctx.now.format("%A, %d %B %Y %H:%M"),
        ctx.timezone
    )
}

#[async_trait]
impl ContextInjector for DatetimeInjector {
    fn name(&self) -> &str {
        "datetime"
    }

    async fn inject_system_context(
        &self,
        ctx: &InjectorContext,
    ) -> anyhow::Result<Option<String>> {
        Ok(Some(format!("Current date and time: {}", render_timestamp(ctx))))
    }

    async fn inject_resume_context(
        &self,
        ctx: &InjectorContext,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        Ok(vec![ChatMessage::system(format!(
            "Session resumed at {}",
            render_timestamp(ctx)
        ))])
    }
}

// ── Pulse injector ────────────────────────────────────────────────────────────

/// Active only for pulse sessions (`metadata.is_pulse`).  Contributes the
/// configured pulse file's contents plus a response-mode or silent-mode
/// instruction block.
pub struct PulseInjector {
    pub file: Option<PathBuf>,
    pub silent: bool,
}

const PULSE_RESPONSE_MODE: &str =
    "This is a scheduled pulse. Review the instructions above and respond with anything \
     that needs operator attention.";
const PULSE_SILENT_MODE: &str =
    "This is a scheduled pulse. Review the instructions above and stay silent unless \
     something needs operator attention.";

impl PulseInjector {
    fn active(ctx: &InjectorContext) -> bool {
        ctx.metadata
            .get("is_pulse")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContextInjector for PulseInjector {
    fn name(&self) -> &str {
        "pulse"
    }

    async fn inject_system_context(
        &self,
        ctx: &InjectorContext,
    ) -> anyhow::Result<Option<String>> {
        if !Self::active(ctx) {
            return Ok(None);
        }
        let mut parts = Vec::new();
        if let Some(path) = &self.file {
            // An unreadable pulse file is not an error; proceed without it.
            match tokio::fs::read_to_string(path).await {
                Ok(contents) if !contents.trim().is_empty() => parts.push(contents),
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "pulse file unavailable"),
            }
        }
        parts.push(
            if self.silent {
                PULSE_SILENT_MODE
            } else {
                PULSE_RESPONSE_MODE
            }
            .to_string(),
        );
        Ok(Some(parts.join("\n\n")))
    }
}

// ── Skills injector ───────────────────────────────────────────────────────────

/// Lists discovered skill manifests whose binary prerequisites exist on the
/// current host.
///
/// A skill is a directory containing a `SKILL.md` file with YAML
/// frontmatter: `name` (optional, falls back to the directory name),
/// `description` (required), and `requires_bins` (optional binaries that
/// must be on `PATH`).
pub struct SkillsInjector {
    pub dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    pub requires_bins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    description: String,
    #[serde(default)]
    requires_bins: Vec<String>,
}

/// Parse the YAML frontmatter of a SKILL.md.  Returns `None` when the
/// frontmatter is missing, malformed, or lacks a description.
pub fn parse_skill_manifest(raw: &str, fallback_name: &str) -> Option<SkillManifest> {
    let rest = raw.trim_start_matches('\n');
    let after_open = rest.strip_prefix("---")?;
    let close = after_open.find("\n---")?;
    let manifest: RawManifest = serde_yaml::from_str(&after_open[..close]).ok()?;
    if manifest.description.trim().is_empty() {
        return None;
    }
    Some(SkillManifest {
        name: manifest.name.unwrap_or_else(|| fallback_name.to_string()),
        description: manifest.description,
        requires_bins: manifest.requires_bins,
    })
}

/// Return `true` when every binary can be found on `PATH`.
fn bins_available(bins: &[String]) -> bool {
    bins.iter().all(|bin| which_available(bin))
}

fn which_available(name: &str) -> bool {
    let Ok(path_var) = std::env::var("PATH") else {
        return false;
    };
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        if Path::new(dir).join(name).is_file() {
            return true;
        }
    }
    false
}

/// Scan the configured directories for skill manifests.
pub fn discover_skills(dirs: &[PathBuf]) -> Vec<SkillManifest> {
    let mut skills = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join("SKILL.md");
            let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            let fallback = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Some(manifest) = parse_skill_manifest(&raw, &fallback) {
                skills.push(manifest);
            }
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

#[async_trait]
impl ContextInjector for SkillsInjector {
    fn name(&self) -> &str {
        "skills"
    }

    async fn inject_system_context(
        &self,
        _ctx: &InjectorContext,
    ) -> anyhow::Result<Option<String>> {
        let available: Vec<SkillManifest> = discover_skills(&self.dirs)
            .into_iter()
            .filter(|s| bins_available(&s.requires_bins))
            .collect();
        if available.is_empty() {
            return Ok(None);
        }
        let mut out = String::from("Available skills:\n");
        for skill in available {
            out.push_str(&format!("- {}: {}\n", skill.name, skill.description.trim()));
        }
        Ok(Some(out.trim_end().to_string()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(metadata: serde_json::Map<String, serde_json::Value>) -> InjectorContext {
        InjectorContext {
            timezone: "UTC".into(),
            now: Utc::now(),
            session_id: SessionId::from("s-1"),
            guidance_path: None,
            metadata,
        }
    }

    fn pulse_metadata() -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("is_pulse".into(), serde_json::json!(true));
        m
    }

    #[tokio::test]
    async fn datetime_contributes_to_both_hooks() {
        let injector = DatetimeInjector;
        let ctx = ctx(Default::default());
        let system = injector.inject_system_context(&ctx).await.unwrap().unwrap();
        assert!(system.contains("Current date and time"));
        assert!(system.contains("(UTC)"));

        let resume = injector.inject_resume_context(&ctx).await.unwrap();
        assert_eq!(resume.len(), 1);
        assert!(resume[0].content.contains("Session resumed"));
    }

    #[tokio::test]
    async fn pulse_is_inactive_without_metadata_flag() {
        let injector = PulseInjector {
            file: None,
            silent: false,
        };
        let out = injector
            .inject_system_context(&ctx(Default::default()))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn pulse_reads_file_and_appends_mode_block() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "Check the backlog.").unwrap();

        let injector = PulseInjector {
            file: Some(f.path().to_path_buf()),
            silent: true,
        };
        let out = injector
            .inject_system_context(&ctx(pulse_metadata()))
            .await
            .unwrap()
            .unwrap();
        assert!(out.contains("Check the backlog."));
        assert!(out.contains("stay silent"));
    }

    #[tokio::test]
    async fn pulse_with_missing_file_still_contributes_mode_block() {
        let injector = PulseInjector {
            file: Some(PathBuf::from("/nonexistent/pulse.md")),
            silent: false,
        };
        let out = injector
            .inject_system_context(&ctx(pulse_metadata()))
            .await
            .unwrap()
            .unwrap();
        assert!(out.contains("scheduled pulse"));
    }

    #[test]
    fn manifest_parsing_and_fallback_name() {
        let raw = "---\ndescription: Deploys things.\nrequires_bins: [sh]\n---\n\nBody.";
        let manifest = parse_skill_manifest(raw, "deployer").unwrap();
        assert_eq!(manifest.name, "deployer");
        assert_eq!(manifest.requires_bins, vec!["sh"]);

        let named = "---\nname: Deploy\ndescription: Deploys things.\n---\n";
        assert_eq!(parse_skill_manifest(named, "x").unwrap().name, "Deploy");

        assert!(parse_skill_manifest("no frontmatter", "x").is_none());
    }

    #[tokio::test]
    async fn skills_with_missing_binaries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::create_dir(&present).unwrap();
        std::fs::write(
            present.join("SKILL.md"),
            "---\ndescription: Uses sh.\nrequires_bins: [sh]\n---\n",
        )
        .unwrap();
        let absent = dir.path().join("absent");
        std::fs::create_dir(&absent).unwrap();
        std::fs::write(
            absent.join("SKILL.md"),
            "---\ndescription: Needs a unicorn.\nrequires_bins: [__tomte_no_such_bin__]\n---\n",
        )
        .unwrap();

        let injector = SkillsInjector {
            dirs: vec![dir.path().to_path_buf()],
        };
        let out = injector
            .inject_system_context(&ctx(Default::default()))
            .await
            .unwrap()
            .unwrap();
        assert!(out.contains("present"));
        assert!(!out.contains("absent"));
    }

    #[tokio::test]
    async fn pipeline_concatenates_in_declared_order() {
        struct Fixed(&'static str);
        #[async_trait]
        impl ContextInjector for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            async fn inject_system_context(
                &self,
                _ctx: &InjectorContext,
            ) -> anyhow::Result<Option<String>> {
                Ok(Some(self.0.to_string()))
            }
        }
        struct Broken;
        #[async_trait]
        impl ContextInjector for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn inject_system_context(
                &self,
                _ctx: &InjectorContext,
            ) -> anyhow::Result<Option<String>> {
                anyhow::bail!("unreadable")
            }
        }

        let mut pipeline = InjectorPipeline::new();
        pipeline.push(Fixed("first"));
        pipeline.push(Broken);
        pipeline.push(Fixed("second"));

        let out = pipeline.system_context(&ctx(Default::default())).await;
        assert_eq!(out, "first\n\nsecond");
    }
}
