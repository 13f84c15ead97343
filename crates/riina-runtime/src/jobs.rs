//! The bot's periodic jobs, each a thin [`ScheduledJob`] over a component.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use riina_misskey::{MentionSource, PlatformClient};
use tracing::{debug, info};

use crate::follow_reconciler::FollowReconciler;
use crate::maintenance::MaintenanceRunner;
use crate::mention_admission::{AdmissionOutcome, MentionAdmission};
use crate::posting::PostComposer;
use crate::scheduler::ScheduledJob;

pub struct FollowSyncJob {
    reconciler: Arc<FollowReconciler>,
}

impl FollowSyncJob {
    pub fn new(reconciler: Arc<FollowReconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl ScheduledJob for FollowSyncJob {
    fn name(&self) -> &str {
        "follow_sync"
    }

    async fn run(&self) -> Result<()> {
        match self.reconciler.try_run_full_sync().await {
            None => {
                debug!("follower sync already in flight; periodic run coalesced");
                Ok(())
            }
            Some(result) => result.map(|_| ()).context("periodic follower sync failed"),
        }
    }
}

/// Fallback for mentions the stream missed. Replays oldest first so replies
/// land in conversation order; dedup absorbs anything the stream already saw.
pub struct MentionPollJob {
    platform: Arc<dyn PlatformClient>,
    admission: Arc<MentionAdmission>,
    limit: usize,
}

impl MentionPollJob {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        admission: Arc<MentionAdmission>,
        limit: usize,
    ) -> Self {
        Self {
            platform,
            admission,
            limit,
        }
    }
}

#[async_trait]
impl ScheduledJob for MentionPollJob {
    fn name(&self) -> &str {
        "mention_poll"
    }

    async fn run(&self) -> Result<()> {
        let mut mentions = self
            .platform
            .fetch_recent_mentions(self.limit)
            .await
            .context("failed to poll recent mentions")?;
        mentions.reverse();
        let mut replied = 0_usize;
        for mut mention in mentions {
            mention.received_via = MentionSource::Poll;
            if matches!(
                self.admission.admit_mention(&mention).await,
                AdmissionOutcome::Replied { .. }
            ) {
                replied += 1;
            }
        }
        if replied > 0 {
            info!(replied, "mention poll replied to missed mentions");
        }
        Ok(())
    }
}

pub struct RandomPostJob {
    composer: Arc<PostComposer>,
}

impl RandomPostJob {
    pub fn new(composer: Arc<PostComposer>) -> Self {
        Self { composer }
    }
}

#[async_trait]
impl ScheduledJob for RandomPostJob {
    fn name(&self) -> &str {
        "random_post"
    }

    async fn run(&self) -> Result<()> {
        self.composer.post_random().await;
        Ok(())
    }
}

pub struct TimelinePostJob {
    composer: Arc<PostComposer>,
}

impl TimelinePostJob {
    pub fn new(composer: Arc<PostComposer>) -> Self {
        Self { composer }
    }
}

#[async_trait]
impl ScheduledJob for TimelinePostJob {
    fn name(&self) -> &str {
        "timeline_post"
    }

    async fn run(&self) -> Result<()> {
        self.composer.post_timeline().await;
        Ok(())
    }
}

pub struct ScheduledPostJob {
    composer: Arc<PostComposer>,
    slot: String,
    name: String,
}

impl ScheduledPostJob {
    pub fn new(composer: Arc<PostComposer>, slot: impl Into<String>) -> Self {
        let slot = slot.into();
        Self {
            composer,
            name: format!("scheduled_{slot}"),
            slot,
        }
    }
}

#[async_trait]
impl ScheduledJob for ScheduledPostJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<()> {
        self.composer.post_scheduled(&self.slot).await;
        Ok(())
    }
}

pub struct CleanupJob {
    maintenance: Arc<MaintenanceRunner>,
}

impl CleanupJob {
    pub fn new(maintenance: Arc<MaintenanceRunner>) -> Self {
        Self { maintenance }
    }
}

#[async_trait]
impl ScheduledJob for CleanupJob {
    fn name(&self) -> &str {
        "db_cleanup"
    }

    async fn run(&self) -> Result<()> {
        self.maintenance.run_cleanup().await.map(|_| ())
    }
}

pub struct BackupJob {
    maintenance: Arc<MaintenanceRunner>,
}

impl BackupJob {
    pub fn new(maintenance: Arc<MaintenanceRunner>) -> Self {
        Self { maintenance }
    }
}

#[async_trait]
impl ScheduledJob for BackupJob {
    fn name(&self) -> &str {
        "db_backup"
    }

    async fn run(&self) -> Result<()> {
        self.maintenance.run_backup().await.map(|_| ())
    }
}

pub struct StatsJob {
    maintenance: Arc<MaintenanceRunner>,
}

impl StatsJob {
    pub fn new(maintenance: Arc<MaintenanceRunner>) -> Self {
        Self { maintenance }
    }
}

#[async_trait]
impl ScheduledJob for StatsJob {
    fn name(&self) -> &str {
        "stats"
    }

    async fn run(&self) -> Result<()> {
        self.maintenance.log_stats().await.map(|_| ())
    }
}
