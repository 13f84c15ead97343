//! Follower-state reconciliation against the platform's follow graph.
//!
//! The reconciler is the only writer of follower rows. Full syncs are
//! single-flight: [`FollowReconciler::run_full_sync`] waits for a running sync,
//! [`FollowReconciler::try_run_full_sync`] skips instead.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use riina_misskey::{PlatformClient, PlatformError, RemoteUser};
use riina_store::{BotStore, BotStoreError, FollowStateUpdate, FollowerRecord};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerPolicy {
    /// Unfollow accounts that stopped following the bot.
    pub auto_unfollow_back: bool,
}

impl Default for ReconcilerPolicy {
    fn default() -> Self {
        Self {
            auto_unfollow_back: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to fetch remote {list} list: {source}")]
    Fetch {
        list: &'static str,
        #[source]
        source: PlatformError,
    },
    #[error("failed to follow '{user_id}': {source}")]
    Follow {
        user_id: String,
        #[source]
        source: PlatformError,
    },
    #[error("'{0}' is not a known follower")]
    UnknownFollower(String),
    #[error(transparent)]
    Store(#[from] BotStoreError),
}

/// Counters produced by one full sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub followers: usize,
    pub following: usize,
    pub mutual: usize,
    pub added: usize,
    pub removed: usize,
    pub unfollowed: usize,
    pub unfollow_failures: usize,
}

pub struct FollowReconciler {
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn BotStore>,
    policy: ReconcilerPolicy,
    sync_gate: Mutex<()>,
}

impl FollowReconciler {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn BotStore>,
        policy: ReconcilerPolicy,
    ) -> Self {
        Self {
            platform,
            store,
            policy,
            sync_gate: Mutex::new(()),
        }
    }

    /// Runs a full sync, waiting for any sync already in flight.
    pub async fn run_full_sync(&self) -> Result<SyncReport, ReconcileError> {
        let _gate = self.sync_gate.lock().await;
        self.sync_locked().await
    }

    /// Runs a full sync unless one is already in flight, in which case `None`.
    pub async fn try_run_full_sync(&self) -> Option<Result<SyncReport, ReconcileError>> {
        let Ok(_gate) = self.sync_gate.try_lock() else {
            debug!("full sync already running; skipping");
            return None;
        };
        Some(self.sync_locked().await)
    }

    /// Cached follower row, if the user is a known follower.
    pub async fn follower(&self, user_id: &str) -> Result<Option<FollowerRecord>, ReconcileError> {
        Ok(self.store.get_follower(user_id).await?)
    }

    /// Follows a known follower back and records the new state.
    pub async fn follow_back(&self, user_id: &str) -> Result<(), ReconcileError> {
        let _gate = self.sync_gate.lock().await;
        if self.store.get_follower(user_id).await?.is_none() {
            return Err(ReconcileError::UnknownFollower(user_id.to_string()));
        }
        self.platform
            .follow(user_id)
            .await
            .map_err(|source| ReconcileError::Follow {
                user_id: user_id.to_string(),
                source,
            })?;
        self.store.set_following_back(user_id, true).await?;
        info!(user_id, "followed back");
        Ok(())
    }

    async fn sync_locked(&self) -> Result<SyncReport, ReconcileError> {
        let followers = self
            .platform
            .fetch_followers()
            .await
            .map_err(|source| ReconcileError::Fetch {
                list: "followers",
                source,
            })?;
        let following = self
            .platform
            .fetch_following()
            .await
            .map_err(|source| ReconcileError::Fetch {
                list: "following",
                source,
            })?;

        let follower_ids: HashSet<&str> = followers.iter().map(|user| user.id.as_str()).collect();
        let following_ids: HashSet<&str> = following.iter().map(|user| user.id.as_str()).collect();
        let mutual: HashSet<&str> = follower_ids.intersection(&following_ids).copied().collect();

        let local = self.store.list_followers().await?;
        let local_ids: HashSet<&str> = local.iter().map(|record| record.user_id.as_str()).collect();

        let mut report = SyncReport {
            followers: follower_ids.len(),
            following: following_ids.len(),
            mutual: mutual.len(),
            ..SyncReport::default()
        };

        let now = Utc::now();
        for user in followers.iter().filter(|user| !local_ids.contains(user.id.as_str())) {
            let record = FollowerRecord::new_follower(user.id.clone(), display_name_of(user), now);
            if self.store.insert_follower(record).await? {
                report.added += 1;
                debug!(user_id = %user.id, "new follower recorded");
            }
        }

        for record in local
            .iter()
            .filter(|record| !follower_ids.contains(record.user_id.as_str()))
        {
            if record.is_following_back && self.policy.auto_unfollow_back {
                match self.platform.unfollow(&record.user_id).await {
                    Ok(()) => {
                        report.unfollowed += 1;
                        info!(user_id = %record.user_id, "unfollowed former follower");
                    }
                    Err(error) => {
                        report.unfollow_failures += 1;
                        warn!(
                            user_id = %record.user_id,
                            error = %error,
                            "unfollow failed; removing follower record anyway"
                        );
                    }
                }
            }
            if self.store.delete_follower(&record.user_id).await? {
                report.removed += 1;
            }
        }

        let updates: Vec<FollowStateUpdate> = followers
            .iter()
            .map(|user| FollowStateUpdate {
                user_id: user.id.clone(),
                display_name: Some(display_name_of(user)),
                is_following_back: mutual.contains(user.id.as_str()),
            })
            .collect();
        self.store.apply_follow_states(&updates).await?;

        info!(
            followers = report.followers,
            following = report.following,
            mutual = report.mutual,
            added = report.added,
            removed = report.removed,
            "follower sync complete"
        );
        Ok(report)
    }
}

fn display_name_of(user: &RemoteUser) -> String {
    user.display_name
        .clone()
        .unwrap_or_else(|| user.username.clone())
}
