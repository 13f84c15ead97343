//! Interval and wall-clock job triggers.
//!
//! Each job gets its own task. A run is never interrupted; cancellation is
//! observed between runs, and an error from one run only gets logged.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stream_connector::wait_for_cancel;

#[derive(Debug, Clone)]
pub enum JobTrigger {
    Every(Duration),
    Cron { schedule: Schedule, timezone: Tz },
}

impl JobTrigger {
    pub fn every_minutes(minutes: u64) -> Self {
        Self::Every(Duration::from_secs(minutes.max(1) * 60))
    }

    /// Once a day at local `HH:MM` in `timezone`.
    pub fn daily_at(time: &str, timezone: Tz) -> Result<Self> {
        let (hour, minute) = parse_hh_mm(time)?;
        let expression = format!("0 {minute} {hour} * * *");
        let schedule = Schedule::from_str(&expression)
            .with_context(|| format!("invalid cron expression '{expression}'"))?;
        Ok(Self::Cron { schedule, timezone })
    }

    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Every(interval) => Some(*interval),
            Self::Cron { schedule, timezone } => {
                let next = schedule.after(&now.with_timezone(timezone)).next()?;
                (next.with_timezone(&Utc) - now).to_std().ok()
            }
        }
    }
}

pub fn parse_hh_mm(value: &str) -> Result<(u32, u32)> {
    let (hour, minute) = value
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("time '{value}' must be HH:MM"))?;
    let hour: u32 = hour
        .parse()
        .with_context(|| format!("invalid hour in '{value}'"))?;
    let minute: u32 = minute
        .parse()
        .with_context(|| format!("invalid minute in '{value}'"))?;
    if hour > 23 || minute > 59 {
        bail!("time '{value}' is out of range");
    }
    Ok((hour, minute))
}

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<()>;
}

pub struct JobScheduler {
    jobs: Vec<(Arc<dyn ScheduledJob>, JobTrigger)>,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            cancel,
            tasks: Vec::new(),
        }
    }

    pub fn add(&mut self, job: Arc<dyn ScheduledJob>, trigger: JobTrigger) {
        self.jobs.push((job, trigger));
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|(job, _)| job.name().to_string()).collect()
    }

    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            warn!("job scheduler already started");
            return;
        }
        for (job, trigger) in &self.jobs {
            info!(job = job.name(), trigger = %trigger_label(trigger), "scheduling job");
            self.tasks.push(tokio::spawn(run_job_loop(
                job.clone(),
                trigger.clone(),
                self.cancel.subscribe(),
            )));
        }
    }

    /// Lets running jobs finish, then ends every job loop.
    pub async fn stop(&mut self) {
        self.cancel.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                warn!(error = %error, "job task failed");
            }
        }
    }
}

fn trigger_label(trigger: &JobTrigger) -> String {
    match trigger {
        JobTrigger::Every(interval) => format!("every {}s", interval.as_secs()),
        JobTrigger::Cron { schedule, timezone } => format!("cron '{schedule}' {timezone}"),
    }
}

async fn run_job_loop(
    job: Arc<dyn ScheduledJob>,
    trigger: JobTrigger,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let Some(delay) = trigger.next_delay(Utc::now()) else {
            warn!(job = job.name(), "trigger has no future occurrence");
            return;
        };
        tokio::select! {
            biased;
            _ = wait_for_cancel(&mut cancel) => return,
            _ = tokio::time::sleep(delay) => {}
        }
        debug!(job = job.name(), "job started");
        match job.run().await {
            Ok(()) => debug!(job = job.name(), "job finished"),
            Err(error) => warn!(job = job.name(), error = %format!("{error:#}"), "job failed"),
        }
    }
}
