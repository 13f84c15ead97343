//! Wires the components together and owns their lifetimes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use riina_ai::TextGenerator;
use riina_core::LogRotationPolicy;
use riina_misskey::PlatformClient;
use riina_store::BotStore;
use tracing::{info, warn};

use crate::decision_log::{DecisionLog, DECISION_LOG_FILE_NAME};
use crate::event_dispatcher::EventDispatcher;
use crate::follow_reconciler::{FollowReconciler, ReconcilerPolicy};
use crate::jobs::{
    BackupJob, CleanupJob, FollowSyncJob, MentionPollJob, RandomPostJob, ScheduledPostJob,
    StatsJob, TimelinePostJob,
};
use crate::maintenance::{MaintenancePolicy, MaintenanceRunner};
use crate::mention_admission::{AdmissionPolicy, MentionAdmission};
use crate::ng_words::NgWordFilter;
use crate::posting::{PostComposer, PostingPolicy};
use crate::rate_limiter::{RateLimitPolicy, ReplyRateLimiter};
use crate::scheduler::{JobScheduler, JobTrigger};
use crate::stream_connector::{ReconnectPolicy, StopReason, StreamConnector, StreamTransport};

pub struct RuntimeDependencies {
    pub platform: Arc<dyn PlatformClient>,
    pub store: Arc<dyn BotStore>,
    pub generator: Arc<dyn TextGenerator>,
    pub transport: Arc<dyn StreamTransport>,
    pub ng_words: Arc<NgWordFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MentionPollSettings {
    pub interval: Duration,
    pub limit: usize,
}

/// Which periodic jobs run, and when. `None` disables a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub follow_sync_interval: Option<Duration>,
    pub mention_poll: Option<MentionPollSettings>,
    pub random_post_interval: Option<Duration>,
    pub timeline_post_interval: Option<Duration>,
    /// `HH:MM` slots with configured messages.
    pub scheduled_post_times: Vec<String>,
    pub cleanup_at: Option<String>,
    pub backup_at: Option<String>,
    pub stats_at: Option<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            follow_sync_interval: Some(Duration::from_secs(30 * 60)),
            mention_poll: None,
            random_post_interval: Some(Duration::from_secs(60 * 60)),
            timeline_post_interval: None,
            scheduled_post_times: Vec::new(),
            cleanup_at: Some("03:00".to_string()),
            backup_at: Some("04:00".to_string()),
            stats_at: Some("06:00".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub admission: AdmissionPolicy,
    pub rate_limit: RateLimitPolicy,
    pub reconciler: ReconcilerPolicy,
    pub reconnect: ReconnectPolicy,
    pub posting: PostingPolicy,
    /// `None` disables cleanup, backup and stats jobs.
    pub maintenance: Option<MaintenancePolicy>,
    pub jobs: JobSettings,
    pub state_dir: Option<PathBuf>,
    /// Decision log rotation; the log lives under `state_dir` when both are set.
    pub decision_log: Option<LogRotationPolicy>,
    pub initial_sync: bool,
    pub backup_on_shutdown: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            admission: AdmissionPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            reconciler: ReconcilerPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            posting: PostingPolicy::default(),
            maintenance: Some(MaintenancePolicy::default()),
            jobs: JobSettings::default(),
            state_dir: None,
            decision_log: None,
            initial_sync: true,
            backup_on_shutdown: true,
        }
    }
}

pub struct BotRuntime {
    reconciler: Arc<FollowReconciler>,
    admission: Arc<MentionAdmission>,
    dispatcher: Arc<EventDispatcher>,
    composer: Arc<PostComposer>,
    maintenance: Option<Arc<MaintenanceRunner>>,
    connector: StreamConnector,
    scheduler: JobScheduler,
    initial_sync: bool,
    backup_on_shutdown: bool,
}

impl BotRuntime {
    pub fn assemble(deps: RuntimeDependencies, settings: RuntimeSettings) -> Result<Self> {
        let decision_log = match (&settings.state_dir, settings.decision_log) {
            (Some(state_dir), Some(rotation)) => Some(Arc::new(DecisionLog::open(
                state_dir.join(DECISION_LOG_FILE_NAME),
                rotation,
            )?)),
            _ => None,
        };

        let reconciler = Arc::new(FollowReconciler::new(
            deps.platform.clone(),
            deps.store.clone(),
            settings.reconciler,
        ));
        let limiter = Arc::new(ReplyRateLimiter::new(deps.store.clone(), settings.rate_limit));
        let mut admission = MentionAdmission::new(
            settings.admission.clone(),
            reconciler.clone(),
            limiter.clone(),
            deps.generator.clone(),
            deps.platform.clone(),
            deps.store.clone(),
        );
        if let Some(log) = &decision_log {
            admission = admission.with_decision_log(log.clone());
        }
        let admission = Arc::new(admission);
        let mut dispatcher = EventDispatcher::new(admission.clone(), reconciler.clone());
        if let Some(log) = &decision_log {
            dispatcher = dispatcher.with_decision_log(log.clone());
        }
        let dispatcher = Arc::new(dispatcher);

        let mut connector =
            StreamConnector::new(deps.transport, dispatcher.clone(), settings.reconnect);
        if let Some(state_dir) = &settings.state_dir {
            connector = connector.with_state_dir(state_dir);
        }

        let composer = Arc::new(
            PostComposer::new(
                deps.platform.clone(),
                deps.generator,
                deps.store.clone(),
                deps.ng_words,
                settings.posting.clone(),
            )
            .context("failed to build post composer")?,
        );
        let maintenance = settings.maintenance.clone().map(|policy| {
            Arc::new(MaintenanceRunner::new(deps.store.clone(), limiter.clone(), policy))
        });

        let scheduler = build_scheduler(
            &settings,
            &reconciler,
            &admission,
            &composer,
            maintenance.as_ref(),
            deps.platform,
        )?;

        Ok(Self {
            reconciler,
            admission,
            dispatcher,
            composer,
            maintenance,
            connector,
            scheduler,
            initial_sync: settings.initial_sync,
            backup_on_shutdown: settings.backup_on_shutdown,
        })
    }

    pub fn reconciler(&self) -> &Arc<FollowReconciler> {
        &self.reconciler
    }

    pub fn admission(&self) -> &Arc<MentionAdmission> {
        &self.admission
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn composer(&self) -> &Arc<PostComposer> {
        &self.composer
    }

    pub fn maintenance(&self) -> Option<&Arc<MaintenanceRunner>> {
        self.maintenance.as_ref()
    }

    pub fn connector(&self) -> &StreamConnector {
        &self.connector
    }

    pub fn job_names(&self) -> Vec<String> {
        self.scheduler.job_names()
    }

    /// Runs until `shutdown` resolves or the stream gives up reconnecting.
    /// The latter is an error.
    pub async fn run_until_shutdown<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.initial_sync {
            match self.reconciler.run_full_sync().await {
                Ok(report) => info!(
                    followers = report.followers,
                    mutual = report.mutual,
                    "initial follower sync complete"
                ),
                Err(error) => warn!(error = %error, "initial follower sync failed"),
            }
        }
        if let Some(maintenance) = &self.maintenance {
            if let Err(error) = maintenance.log_stats().await {
                warn!(error = %format!("{error:#}"), "startup stats unavailable");
            }
        }

        self.scheduler.start();
        self.connector.start();
        info!(jobs = ?self.scheduler.job_names(), "bot runtime started");

        let stream_stop = tokio::select! {
            _ = shutdown => {
                info!("shutdown requested");
                None
            }
            reason = self.connector.wait_until_stopped() => Some(reason),
        };

        self.connector.stop().await;
        self.scheduler.stop().await;
        if self.backup_on_shutdown {
            if let Some(maintenance) = &self.maintenance {
                if let Err(error) = maintenance.run_backup().await {
                    warn!(error = %format!("{error:#}"), "shutdown backup failed");
                }
            }
        }
        info!("bot runtime stopped");

        match stream_stop {
            Some(StopReason::BackoffExhausted {
                failures,
                last_error,
            }) => bail!(
                "stream connection lost after {failures} consecutive failures: {last_error}"
            ),
            _ => Ok(()),
        }
    }
}

fn build_scheduler(
    settings: &RuntimeSettings,
    reconciler: &Arc<FollowReconciler>,
    admission: &Arc<MentionAdmission>,
    composer: &Arc<PostComposer>,
    maintenance: Option<&Arc<MaintenanceRunner>>,
    platform: Arc<dyn PlatformClient>,
) -> Result<JobScheduler> {
    let jobs = &settings.jobs;
    let timezone = settings.posting.timezone;
    let mut scheduler = JobScheduler::new();

    if let Some(interval) = jobs.follow_sync_interval {
        scheduler.add(
            Arc::new(FollowSyncJob::new(reconciler.clone())),
            JobTrigger::Every(interval),
        );
    }
    if let Some(poll) = jobs.mention_poll {
        scheduler.add(
            Arc::new(MentionPollJob::new(platform, admission.clone(), poll.limit)),
            JobTrigger::Every(poll.interval),
        );
    }
    if let Some(interval) = jobs.random_post_interval {
        scheduler.add(
            Arc::new(RandomPostJob::new(composer.clone())),
            JobTrigger::Every(interval),
        );
    }
    if let Some(interval) = jobs.timeline_post_interval {
        scheduler.add(
            Arc::new(TimelinePostJob::new(composer.clone())),
            JobTrigger::Every(interval),
        );
    }
    for slot in &jobs.scheduled_post_times {
        let trigger = JobTrigger::daily_at(slot, timezone)
            .with_context(|| format!("invalid scheduled post time '{slot}'"))?;
        scheduler.add(Arc::new(ScheduledPostJob::new(composer.clone(), slot)), trigger);
    }
    if let Some(maintenance) = maintenance {
        if let Some(at) = &jobs.cleanup_at {
            scheduler.add(
                Arc::new(CleanupJob::new(maintenance.clone())),
                JobTrigger::daily_at(at, timezone)?,
            );
        }
        if let Some(at) = &jobs.backup_at {
            scheduler.add(
                Arc::new(BackupJob::new(maintenance.clone())),
                JobTrigger::daily_at(at, timezone)?,
            );
        }
        if let Some(at) = &jobs.stats_at {
            scheduler.add(
                Arc::new(StatsJob::new(maintenance.clone())),
                JobTrigger::daily_at(at, timezone)?,
            );
        }
    }
    Ok(scheduler)
}
