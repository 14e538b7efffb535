// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Named cron jobs.
//!
//! Each job pairs a cron expression with an async action.  The daemon owns
//! one tick loop; `trigger` runs a job immediately in addition to its
//! scheduled cadence.  `next_run` is `None` for disabled jobs.
//!
//! Job panics/errors are the action's own business — actions are infallible
//! futures and the loop never dies because of one job.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    #[error("invalid schedule \"{expression}\": {message}")]
    InvalidSchedule { expression: String, message: String },
}

/// Listing entry returned by [`Scheduler::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub name: String,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
}

struct Job {
    schedule_expr: String,
    schedule: Schedule,
    enabled: bool,
    action: JobAction,
}

impl Job {
    fn next_run(&self) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        self.schedule.upcoming(Utc).next()
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named job.  The expression uses the seconds-resolution
    /// cron grammar (`sec min hour dom month dow [year]`).
    pub fn register(
        &self,
        name: &str,
        expression: &str,
        enabled: bool,
        action: JobAction,
    ) -> Result<(), SchedulerError> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }
        jobs.insert(
            name.to_string(),
            Job {
                schedule_expr: expression.to_string(),
                schedule,
                enabled,
                action,
            },
        );
        debug!(job = name, expression, enabled, "job registered");
        Ok(())
    }

    /// Drop every registered job (used by `daemon.reload`).
    pub fn clear(&self) {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<JobInfo> = jobs
            .iter()
            .map(|(name, job)| JobInfo {
                name: name.clone(),
                schedule: job.schedule_expr.clone(),
                next_run: job.next_run(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Execute a job immediately, independent of its schedule.
    pub async fn trigger(&self, name: &str) -> Result<(), SchedulerError> {
        let action = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let job = jobs
                .get(name)
                .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
            job.action.clone()
        };
        info!(job = name, "job triggered manually");
        action().await;
        Ok(())
    }

    /// Names and fire-times of jobs due at or before `now`, and the nearest
    /// upcoming deadline (for the tick loop's sleep).
    fn due_jobs(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> Vec<(String, JobAction)> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter()
            .filter(|(_, job)| job.enabled)
            .filter(|(_, job)| {
                job.schedule
                    .after(&window_start)
                    .next()
                    .map(|at| at <= now)
                    .unwrap_or(false)
            })
            .map(|(name, job)| (name.clone(), job.action.clone()))
            .collect()
    }

    /// Tick loop: fire due jobs once per second until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started");
        let mut window_start = Utc::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let now = Utc::now();
                    for (name, action) in self.due_jobs(window_start, now) {
                        debug!(job = %name, "job fired");
                        // Jobs run detached so a slow job never delays the tick.
                        tokio::spawn(action());
                    }
                    window_start = now;
                }
            }
        }
        info!("scheduler stopped");
    }
}

/// Validate a cron expression without registering anything.
pub fn validate_schedule(expression: &str) -> Result<(), SchedulerError> {
    Schedule::from_str(expression)
        .map(|_| ())
        .map_err(|e| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_action(counter: Arc<AtomicUsize>) -> JobAction {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn register_rejects_bad_expressions() {
        let scheduler = Scheduler::new();
        let err = scheduler
            .register("bad", "not a cron", true, counting_action(Default::default()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn register_rejects_duplicates() {
        let scheduler = Scheduler::new();
        scheduler
            .register("a", "0 * * * * *", true, counting_action(Default::default()))
            .unwrap();
        let err = scheduler
            .register("a", "0 * * * * *", true, counting_action(Default::default()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob(_)));
    }

    #[test]
    fn list_reports_next_run_only_when_enabled() {
        let scheduler = Scheduler::new();
        scheduler
            .register("on", "0 * * * * *", true, counting_action(Default::default()))
            .unwrap();
        scheduler
            .register("off", "0 * * * * *", false, counting_action(Default::default()))
            .unwrap();

        let infos = scheduler.list();
        assert_eq!(infos.len(), 2);
        let on = infos.iter().find(|i| i.name == "on").unwrap();
        let off = infos.iter().find(|i| i.name == "off").unwrap();
        assert!(on.next_run.is_some());
        assert!(off.next_run.is_none());
    }

    #[tokio::test]
    async fn trigger_runs_immediately() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("job", "0 0 1 1 1 *", true, counting_action(counter.clone()))
            .unwrap();

        scheduler.trigger("job").await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_unknown_job_is_an_error() {
        let scheduler = Scheduler::new();
        let err = scheduler.trigger("ghost").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn tick_loop_fires_every_second_job() {
        let scheduler = Arc::new(Scheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        // Every second.
        scheduler
            .register("tick", "* * * * * *", true, counting_action(counter.clone()))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "job should have fired at least once, got {fired}");
    }

    #[test]
    fn validate_schedule_accepts_and_rejects() {
        assert!(validate_schedule("0 0 9 * * Mon-Fri").is_ok());
        assert!(validate_schedule("whenever").is_err());
    }
}
