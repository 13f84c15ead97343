//! Persistence for follower state, reply quota and post history.
//!
//! [`BotStore`] is the contract the runtime talks to. [`SqliteBotStore`] is the
//! durable backend; [`InMemoryBotStore`] backs tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteBotStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, BotStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum BotStoreError {
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("backup target '{0}' already exists")]
    BackupTargetExists(PathBuf),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Local view of one remote account that follows the bot.
pub struct FollowerRecord {
    pub user_id: String,
    pub display_name: String,
    pub is_follower: bool,
    pub is_following_back: bool,
    pub first_seen: DateTime<Utc>,
}

impl FollowerRecord {
    pub fn new_follower(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        first_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            is_follower: true,
            is_following_back: false,
            first_seen,
        }
    }

    /// Both directions of the follow relationship hold.
    pub fn is_mutual(&self) -> bool {
        self.is_follower && self.is_following_back
    }
}

/// One row of a bulk follow-state overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowStateUpdate {
    pub user_id: String,
    pub display_name: Option<String>,
    pub is_following_back: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Why a note was published.
pub enum PostKind {
    Reply,
    Random,
    Timeline,
    /// Fixed-time post keyed by its `HH:MM` slot.
    Scheduled(String),
}

impl PostKind {
    pub fn as_label(&self) -> String {
        match self {
            Self::Reply => "reply".to_string(),
            Self::Random => "random".to_string(),
            Self::Timeline => "timeline".to_string(),
            Self::Scheduled(slot) => format!("scheduled_{slot}"),
        }
    }

    pub fn from_label(label: &str) -> StoreResult<Self> {
        match label {
            "reply" => Ok(Self::Reply),
            "random" => Ok(Self::Random),
            "timeline" => Ok(Self::Timeline),
            other => other
                .strip_prefix("scheduled_")
                .filter(|slot| !slot.is_empty())
                .map(|slot| Self::Scheduled(slot.to_string()))
                .ok_or_else(|| BotStoreError::InvalidPersistedValue {
                    field: "post_kind",
                    value: other.to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Append-only history entry for a published note.
pub struct PostRecord {
    pub note_id: String,
    pub reply_to: Option<String>,
    pub kind: PostKind,
    pub content: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub followers: u64,
    pub mutual_followers: u64,
    pub posts: u64,
    pub reply_quota_entries: u64,
    pub oldest_post_at: Option<DateTime<Utc>>,
    pub newest_post_at: Option<DateTime<Utc>>,
    pub database_bytes: Option<u64>,
}

/// Async store contract used by the reconciler, rate limiter and jobs.
#[async_trait]
pub trait BotStore: Send + Sync {
    async fn list_followers(&self) -> StoreResult<Vec<FollowerRecord>>;
    async fn get_follower(&self, user_id: &str) -> StoreResult<Option<FollowerRecord>>;
    /// Inserts `record` unless a row for the same user exists. Returns whether a
    /// row was written.
    async fn insert_follower(&self, record: FollowerRecord) -> StoreResult<bool>;
    async fn delete_follower(&self, user_id: &str) -> StoreResult<bool>;
    async fn set_following_back(&self, user_id: &str, following_back: bool) -> StoreResult<bool>;
    /// Overwrites `is_following_back` (and the display name when given) for every
    /// listed user in one transaction. Unknown users are skipped.
    async fn apply_follow_states(&self, updates: &[FollowStateUpdate]) -> StoreResult<usize>;

    async fn record_reply(&self, user_id: &str, replied_at: DateTime<Utc>) -> StoreResult<()>;
    /// Counts quota entries with `after < replied_at <= until`.
    async fn count_replies_between(
        &self,
        user_id: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<u64>;
    async fn purge_replies_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    async fn append_post(&self, post: PostRecord) -> StoreResult<()>;
    async fn purge_posts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Reclaims space after purges. No-op for backends without a file.
    async fn compact(&self) -> StoreResult<()> {
        Ok(())
    }
    async fn stats(&self) -> StoreResult<StoreStats>;
    /// Writes a consistent copy of the store to `destination`, which must not
    /// exist yet.
    async fn backup_to(&self, destination: &Path) -> StoreResult<()>;
}

/// In-memory implementation for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryBotStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default, Serialize)]
struct MemoryInner {
    followers: HashMap<String, FollowerRecord>,
    replies: Vec<(String, DateTime<Utc>)>,
    posts: Vec<PostRecord>,
}

impl InMemoryBotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every post written so far, oldest first.
    pub async fn posts(&self) -> Vec<PostRecord> {
        self.inner.read().await.posts.clone()
    }
}

#[async_trait]
impl BotStore for InMemoryBotStore {
    async fn list_followers(&self) -> StoreResult<Vec<FollowerRecord>> {
        let inner = self.inner.read().await;
        let mut followers = inner.followers.values().cloned().collect::<Vec<_>>();
        followers.sort_by(|left, right| left.user_id.cmp(&right.user_id));
        Ok(followers)
    }

    async fn get_follower(&self, user_id: &str) -> StoreResult<Option<FollowerRecord>> {
        Ok(self.inner.read().await.followers.get(user_id).cloned())
    }

    async fn insert_follower(&self, record: FollowerRecord) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.followers.contains_key(&record.user_id) {
            return Ok(false);
        }
        inner.followers.insert(record.user_id.clone(), record);
        Ok(true)
    }

    async fn delete_follower(&self, user_id: &str) -> StoreResult<bool> {
        Ok(self.inner.write().await.followers.remove(user_id).is_some())
    }

    async fn set_following_back(&self, user_id: &str, following_back: bool) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.followers.get_mut(user_id) {
            Some(record) => {
                record.is_following_back = following_back;
                true
            }
            None => false,
        })
    }

    async fn apply_follow_states(&self, updates: &[FollowStateUpdate]) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut applied = 0;
        for update in updates {
            if let Some(record) = inner.followers.get_mut(&update.user_id) {
                record.is_following_back = update.is_following_back;
                if let Some(display_name) = &update.display_name {
                    record.display_name = display_name.clone();
                }
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn record_reply(&self, user_id: &str, replied_at: DateTime<Utc>) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .replies
            .push((user_id.to_string(), replied_at));
        Ok(())
    }

    async fn count_replies_between(
        &self,
        user_id: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let inner = self.inner.read().await;
        let count = inner
            .replies
            .iter()
            .filter(|(user, at)| user == user_id && *at > after && *at <= until)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn purge_replies_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.replies.len();
        inner.replies.retain(|(_, at)| *at >= cutoff);
        Ok(before - inner.replies.len())
    }

    async fn append_post(&self, post: PostRecord) -> StoreResult<()> {
        self.inner.write().await.posts.push(post);
        Ok(())
    }

    async fn purge_posts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.posts.len();
        inner.posts.retain(|post| post.posted_at >= cutoff);
        Ok(before - inner.posts.len())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.inner.read().await;
        let count = |value: usize| u64::try_from(value).unwrap_or(u64::MAX);
        Ok(StoreStats {
            followers: count(inner.followers.len()),
            mutual_followers: count(
                inner
                    .followers
                    .values()
                    .filter(|record| record.is_mutual())
                    .count(),
            ),
            posts: count(inner.posts.len()),
            reply_quota_entries: count(inner.replies.len()),
            oldest_post_at: inner.posts.iter().map(|post| post.posted_at).min(),
            newest_post_at: inner.posts.iter().map(|post| post.posted_at).max(),
            database_bytes: None,
        })
    }

    async fn backup_to(&self, destination: &Path) -> StoreResult<()> {
        if destination.exists() {
            return Err(BotStoreError::BackupTargetExists(destination.to_path_buf()));
        }
        if let Some(parent) = destination.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = serde_json::to_string_pretty(&*self.inner.read().await)?;
        std::fs::write(destination, snapshot)?;
        Ok(())
    }
}
