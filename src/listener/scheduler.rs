// src/listener/scheduler.rs

//! Time-based task source.
//!
//! Each `[[schedule]]` entry for an enabled resource type becomes a job
//! that runs either every N seconds or once a day at a local `HH:MM`.
//! There is no broker to settle against: finished tasks come back on the
//! scheduler's processed queue and only failed ones are enqueued again.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone};
use serde_json::{Map, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{TaskReceiver, TaskSender};
use crate::config::{ConfigFile, ScheduleEntry};
use crate::exec::StopReceiver;
use crate::task::params::INTERVAL;
use crate::task::{Action, Origin, Params, Task, TaskState};

/// Operation identity of every scheduled task.
pub const SCHEDULER_OPERATION_ID: &str = "LOCAL-SCHED";

const MAX_SLEEP: Duration = Duration::from_secs(1);
const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTiming {
    Interval(Duration),
    Daily(NaiveTime),
}

impl JobTiming {
    pub fn from_entry(entry: &ScheduleEntry) -> Result<Self, String> {
        match (entry.interval, entry.daily, entry.at.as_deref()) {
            (Some(_), true, _) => Err("`interval` and `daily` are mutually exclusive".to_string()),
            (Some(0), false, _) => Err("`interval` must be >= 1 second".to_string()),
            (Some(secs), false, _) => Ok(JobTiming::Interval(Duration::from_secs(secs))),
            (None, true, Some(at)) => NaiveTime::parse_from_str(at, "%H:%M")
                .map(JobTiming::Daily)
                .map_err(|e| format!("invalid `at` value '{at}': {e}")),
            (None, true, None) => Err("daily jobs need `at = \"HH:MM\"`".to_string()),
            (None, false, _) => Err("either `interval` or `daily` must be set".to_string()),
        }
    }

    /// Reporting interval handed to the task; query tasks derive their
    /// cache window from it.
    pub fn interval_secs(&self) -> u64 {
        match self {
            JobTiming::Interval(every) => every.as_secs(),
            JobTiming::Daily(_) => DAY_SECS,
        }
    }

    pub fn next_after(&self, now: DateTime<Local>) -> DateTime<Local> {
        match self {
            JobTiming::Interval(every) => {
                now + chrono::Duration::from_std(*every).unwrap_or(chrono::Duration::seconds(1))
            }
            JobTiming::Daily(at) => {
                let today = now.date_naive().and_time(*at);
                let candidate = if today > now.naive_local() {
                    today
                } else {
                    today + chrono::Duration::days(1)
                };
                Local
                    .from_local_datetime(&candidate)
                    .earliest()
                    .unwrap_or(now + chrono::Duration::days(1))
            }
        }
    }
}

impl std::fmt::Display for JobTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobTiming::Interval(every) => write!(f, "every {}s", every.as_secs()),
            JobTiming::Daily(at) => write!(f, "daily at {}", at.format("%H:%M")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub res_type: String,
    pub action: Action,
    pub timing: JobTiming,
    pub params: Map<String, Value>,
    pub next_run: DateTime<Local>,
}

impl Job {
    pub fn from_entry(entry: &ScheduleEntry, now: DateTime<Local>) -> Result<Self, String> {
        let action = Action::from_str(&entry.action)?;
        let timing = JobTiming::from_entry(entry)?;
        let params = match serde_json::to_value(&entry.params).map_err(|e| e.to_string())? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            res_type: entry.res_type.clone(),
            action,
            timing,
            params,
            next_run: timing.next_after(now),
        })
    }

    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.next_run <= now
    }

    /// The task this job produces when it fires at `now`.
    pub fn make_task(&self, now: DateTime<Local>) -> Task {
        let mut params = Params::from(self.params.clone());
        params.insert(INTERVAL, self.timing.interval_secs());
        Task::new(
            Some(format!(
                "{}.{}.{}",
                now.format("%Y-%m-%dT%H:%M:%S"),
                self.res_type,
                self.action
            )),
            Origin::Scheduler,
            SCHEDULER_OPERATION_ID,
            format!("{}.{}", self.res_type, self.action),
            self.res_type.clone(),
            self.action,
            params,
        )
    }
}

pub struct TimeListener {
    jobs: Vec<Job>,
    intake: TaskSender,
    processed: TaskReceiver,
}

impl TimeListener {
    /// Jobs for every schedule entry whose resource type is enabled.
    pub fn from_config(cfg: &ConfigFile, intake: TaskSender, processed: TaskReceiver) -> Self {
        let now = Local::now();
        let jobs = cfg
            .schedule
            .iter()
            .filter(|entry| {
                let enabled = cfg.is_enabled(&entry.res_type);
                if !enabled {
                    debug!(res_type = %entry.res_type, "resource type not enabled, skipping schedule");
                }
                enabled
            })
            .filter_map(|entry| match Job::from_entry(entry, now) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(res_type = %entry.res_type, action = %entry.action, error = %e, "skipping schedule entry");
                    None
                }
            })
            .collect();
        Self::new(jobs, intake, processed)
    }

    pub fn new(jobs: Vec<Job>, intake: TaskSender, processed: TaskReceiver) -> Self {
        Self {
            jobs,
            intake,
            processed,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Enqueue a task for every job due at `now`. Returns how many fired.
    pub fn run_pending(&mut self, now: DateTime<Local>) -> usize {
        let mut fired = 0;
        for job in self.jobs.iter_mut().filter(|job| job.is_due(now)) {
            let task = job.make_task(now);
            debug!(task = %task, "scheduled job due");
            if let Err(e) = self.intake.send(task) {
                warn!(task = %e.0, "intake queue closed, scheduled task dropped");
            }
            job.next_run = job.timing.next_after(now);
            fired += 1;
        }
        fired
    }

    /// Time until the earliest job is due.
    pub fn idle_for(&self, now: DateTime<Local>) -> Option<Duration> {
        self.jobs
            .iter()
            .map(|job| (job.next_run - now).to_std().unwrap_or(Duration::ZERO))
            .min()
    }

    /// Put failed scheduled tasks back on the intake queue.
    pub fn requeue_failed(&mut self) -> usize {
        let mut requeued = 0;
        while let Ok(mut task) = self.processed.try_recv() {
            if task.state != TaskState::Failed {
                debug!(task = %task, "scheduled task finished");
                continue;
            }
            task.transition(TaskState::New);
            debug!(task = %task, "re-enqueueing failed scheduled task");
            if let Err(e) = self.intake.send(task) {
                warn!(task = %e.0, "intake queue closed, failed task dropped");
                continue;
            }
            requeued += 1;
        }
        requeued
    }

    pub async fn run(mut self, mut stop: StopReceiver) {
        let span = info_span!("time_listener");
        async move {
            info!(jobs = self.jobs.len(), "time listener started");
            for job in &self.jobs {
                info!(res_type = %job.res_type, action = %job.action, timing = %job.timing, "scheduled");
            }

            loop {
                let now = Local::now();
                self.run_pending(now);
                self.requeue_failed();

                let nap = self.idle_for(now).map_or(MAX_SLEEP, |d| d.min(MAX_SLEEP));
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || stop.borrow().is_some() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(nap) => {}
                }
            }
            info!("time listener stopped");
        }
        .instrument(span)
        .await
    }
}
