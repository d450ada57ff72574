//! Periodic admin commands and server restarts
//!
//! A schedule file looks like:
//!
//! ```json
//! {
//!   "jobs": [
//!     { "command": "say -1 Server restarts every 4 hours", "every": 900, "delay": 60 },
//!     { "restart": true, "every": 14400 }
//!   ]
//! }
//! ```
//!
//! `every` and `delay` are in seconds. A job fires first after `delay`
//! (immediately if omitted) and then every `every` seconds.

use crate::error::WatchError;
use crate::wait_for_shutdown;
use crate::watcher::RestartHandle;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Job {
    Command {
        command: String,
        every: u64,
        #[serde(default)]
        delay: u64,
    },
    Restart {
        restart: bool,
        every: u64,
        #[serde(default)]
        delay: u64,
    },
}

impl Job {
    pub fn every(&self) -> Duration {
        match self {
            Job::Command { every, .. } | Job::Restart { every, .. } => Duration::from_secs(*every),
        }
    }

    pub fn delay(&self) -> Duration {
        match self {
            Job::Command { delay, .. } | Job::Restart { delay, .. } => Duration::from_secs(*delay),
        }
    }

    fn is_enabled(&self) -> bool {
        match self {
            Job::Command { command, .. } => !command.is_empty(),
            Job::Restart { restart, .. } => *restart,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl Schedule {
    pub fn from_json(json: &str) -> Result<Self, WatchError> {
        let schedule: Schedule = serde_json::from_str(json)?;
        if schedule.jobs.iter().any(|job| job.every().is_zero()) {
            return Err(WatchError::Schedule(serde::de::Error::custom(
                "job interval must be at least one second",
            )));
        }
        Ok(schedule)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, WatchError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let schedule = Self::from_json(&json)?;
        info!(
            "Loaded {} scheduled jobs from {}",
            schedule.jobs.len(),
            path.as_ref().display()
        );
        Ok(schedule)
    }
}

/// Running scheduled jobs, one task each
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts one task per enabled job.
    ///
    /// Commands go into the bounded `commands` queue; restart jobs use
    /// `restarts` and are skipped with a warning when there is no watcher.
    pub fn spawn(
        schedule: &Schedule,
        commands: mpsc::Sender<String>,
        restarts: Option<RestartHandle>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut tasks = Vec::new();

        for job in schedule.jobs.iter().filter(|job| job.is_enabled()) {
            if matches!(job, Job::Restart { .. }) && restarts.is_none() {
                warn!("Restart job configured without a watcher, skipping");
                continue;
            }
            debug!("Scheduling {:?}", job);
            tasks.push(tokio::spawn(run_job(
                job.clone(),
                commands.clone(),
                restarts.clone(),
                shutdown.clone(),
            )));
        }

        Self { tasks }
    }

    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every job task to stop after shutdown was signalled.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Scheduled job panicked: {}", e);
            }
        }
    }
}

async fn run_job(
    job: Job,
    commands: mpsc::Sender<String>,
    restarts: Option<RestartHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + job.delay(), job.every());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        match &job {
            Job::Command { command, .. } => {
                let sent = tokio::select! {
                    sent = commands.send(command.clone()) => sent,
                    _ = wait_for_shutdown(&mut shutdown) => break,
                };
                if sent.is_err() {
                    warn!("Command queue closed, stopping job {:?}", command);
                    break;
                }
                debug!("Queued scheduled command {:?}", command);
            }
            Job::Restart { .. } => {
                info!("Scheduled server restart");
                if let Some(handle) = &restarts {
                    if let Err(e) = handle.restart() {
                        warn!("Scheduled restart skipped: {}", e);
                    }
                }
            }
        }
    }
}
