use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use riina_store::{BotStore, StoreStats};
use serde::Serialize;
use tracing::{info, warn};

use crate::posting::DEFAULT_TIMEZONE;
use crate::rate_limiter::ReplyRateLimiter;

pub const BACKUP_FILE_PREFIX: &str = "bot_backup_";
pub const BACKUP_FILE_SUFFIX: &str = ".db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenancePolicy {
    pub retention_days: u32,
    pub backup_dir: PathBuf,
    pub keep_backups: usize,
    /// Zone used for backup file timestamps.
    pub timezone: Tz,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            backup_dir: PathBuf::from("backups"),
            keep_backups: 7,
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub posts_removed: usize,
    pub quota_entries_removed: usize,
}

pub struct MaintenanceRunner {
    store: Arc<dyn BotStore>,
    limiter: Arc<ReplyRateLimiter>,
    policy: MaintenancePolicy,
}

impl MaintenanceRunner {
    pub fn new(
        store: Arc<dyn BotStore>,
        limiter: Arc<ReplyRateLimiter>,
        policy: MaintenancePolicy,
    ) -> Self {
        Self {
            store,
            limiter,
            policy,
        }
    }

    pub fn policy(&self) -> &MaintenancePolicy {
        &self.policy
    }

    pub async fn run_cleanup(&self) -> Result<CleanupReport> {
        self.run_cleanup_at(Utc::now()).await
    }

    /// Drops post history and quota rows older than the retention window,
    /// then compacts the database.
    pub async fn run_cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - Duration::days(i64::from(self.policy.retention_days));
        let posts_removed = self
            .store
            .purge_posts_before(cutoff)
            .await
            .context("failed to purge post history")?;
        let quota_entries_removed = self
            .limiter
            .purge_before(cutoff)
            .await
            .context("failed to purge reply quota")?;
        self.store
            .compact()
            .await
            .context("failed to compact database")?;
        info!(
            posts_removed,
            quota_entries_removed,
            retention_days = self.policy.retention_days,
            "database cleanup complete"
        );
        Ok(CleanupReport {
            posts_removed,
            quota_entries_removed,
        })
    }

    pub async fn run_backup(&self) -> Result<PathBuf> {
        self.run_backup_at(Utc::now()).await
    }

    /// Writes `bot_backup_YYYYmmdd_HHMMSS.db` and prunes all but the newest
    /// `keep_backups` files.
    pub async fn run_backup_at(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let stamp = now
            .with_timezone(&self.policy.timezone)
            .format("%Y%m%d_%H%M%S");
        let destination = self
            .policy
            .backup_dir
            .join(format!("{BACKUP_FILE_PREFIX}{stamp}{BACKUP_FILE_SUFFIX}"));
        self.store
            .backup_to(&destination)
            .await
            .with_context(|| format!("failed to back up database to {}", destination.display()))?;
        let size_bytes = std::fs::metadata(&destination)
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        info!(path = %destination.display(), size_bytes, "database backup written");

        let removed = prune_backups(&self.policy.backup_dir, self.policy.keep_backups)?;
        for path in &removed {
            info!(path = %path.display(), "old backup removed");
        }
        Ok(destination)
    }

    pub async fn log_stats(&self) -> Result<StoreStats> {
        let stats = self
            .store
            .stats()
            .await
            .context("failed to read database stats")?;
        info!(
            followers = stats.followers,
            mutual_followers = stats.mutual_followers,
            posts = stats.posts,
            reply_quota_entries = stats.reply_quota_entries,
            oldest_post_at = ?stats.oldest_post_at,
            newest_post_at = ?stats.newest_post_at,
            database_bytes = ?stats.database_bytes,
            "database stats"
        );
        Ok(stats)
    }
}

/// Backup names sort chronologically, so the lexically largest are newest.
pub fn prune_backups(backup_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in std::fs::read_dir(backup_dir)
        .with_context(|| format!("failed to read {}", backup_dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read {}", backup_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(BACKUP_FILE_PREFIX) && name.ends_with(BACKUP_FILE_SUFFIX) {
            backups.push(entry.path());
        }
    }
    backups.sort();
    backups.reverse();

    let mut removed = Vec::new();
    for path in backups.into_iter().skip(keep) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to remove old backup")
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use riina_store::{InMemoryBotStore, PostKind, PostRecord};
    use tempfile::tempdir;

    use super::*;
    use crate::rate_limiter::RateLimitPolicy;

    fn runner(store: Arc<InMemoryBotStore>, backup_dir: &Path) -> MaintenanceRunner {
        let limiter = Arc::new(ReplyRateLimiter::new(store.clone(), RateLimitPolicy::default()));
        MaintenanceRunner::new(
            store,
            limiter,
            MaintenancePolicy {
                backup_dir: backup_dir.to_path_buf(),
                ..MaintenancePolicy::default()
            },
        )
    }

    fn post(note_id: &str, posted_at: DateTime<Utc>) -> PostRecord {
        PostRecord {
            note_id: note_id.to_string(),
            reply_to: None,
            kind: PostKind::Random,
            content: "hello".to_string(),
            posted_at,
        }
    }

    #[tokio::test]
    async fn functional_cleanup_drops_rows_past_retention() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(InMemoryBotStore::new());
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).single().expect("now");
        store.append_post(post("old", now - Duration::days(40))).await.expect("append");
        store.append_post(post("new", now - Duration::days(1))).await.expect("append");
        store.record_reply("u1", now - Duration::days(31)).await.expect("record");
        store.record_reply("u1", now - Duration::hours(1)).await.expect("record");

        let report = runner(store.clone(), temp.path())
            .run_cleanup_at(now)
            .await
            .expect("cleanup");

        assert_eq!(
            report,
            CleanupReport {
                posts_removed: 1,
                quota_entries_removed: 1,
            }
        );
        let remaining: Vec<String> = store
            .posts()
            .await
            .into_iter()
            .map(|post| post.note_id)
            .collect();
        assert_eq!(remaining, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn functional_backup_uses_local_timestamp_name() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(InMemoryBotStore::new());
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 5).single().expect("now");

        let path = runner(store, temp.path())
            .run_backup_at(now)
            .await
            .expect("backup");

        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("bot_backup_20260602_040005.db")
        );
        assert!(path.exists());
    }

    #[test]
    fn unit_prune_keeps_newest_backups_only() {
        let temp = tempdir().expect("tempdir");
        for day in 1..=9 {
            std::fs::write(temp.path().join(format!("bot_backup_202601{day:02}_040000.db")), b"x")
                .expect("write");
        }
        std::fs::write(temp.path().join("notes.txt"), b"keep").expect("write");

        let removed = prune_backups(temp.path(), 7).expect("prune");

        assert_eq!(removed.len(), 2);
        assert!(!temp.path().join("bot_backup_20260101_040000.db").exists());
        assert!(!temp.path().join("bot_backup_20260102_040000.db").exists());
        assert!(temp.path().join("bot_backup_20260109_040000.db").exists());
        assert!(temp.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn unit_stats_reflect_store_contents() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(InMemoryBotStore::new());
        store.append_post(post("n1", Utc::now())).await.expect("append");

        let stats = runner(store, temp.path()).log_stats().await.expect("stats");

        assert_eq!(stats.posts, 1);
        assert_eq!(stats.followers, 0);
    }
}
