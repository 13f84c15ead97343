//! SQLite-backed [`BotStore`].

use crate::{
    BotStore, BotStoreError, FollowStateUpdate, FollowerRecord, PostKind, PostRecord,
    StoreResult, StoreStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use riina_core::{datetime_from_unix_ms, datetime_to_unix_ms};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durable store backed by a single SQLite file.
#[derive(Debug)]
pub struct SqliteBotStore {
    db_path: PathBuf,
}

impl SqliteBotStore {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS followers (
            user_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            is_follower INTEGER NOT NULL,
            is_following_back INTEGER NOT NULL,
            first_seen TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reply_quota (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            replied_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reply_quota_user_time
            ON reply_quota (user_id, replied_at_ms);

        CREATE TABLE IF NOT EXISTS posts (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            note_id TEXT NOT NULL,
            reply_to TEXT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            posted_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_posts_time ON posts (posted_at_ms);
        "#,
    )?;
    Ok(())
}

const FOLLOWER_COLUMNS: &str =
    "user_id, display_name, is_follower, is_following_back, first_seen";

fn follower_from_row(row: &rusqlite::Row<'_>) -> StoreResult<FollowerRecord> {
    Ok(FollowerRecord {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        is_follower: row.get(2)?,
        is_following_back: row.get(3)?,
        first_seen: timestamp_from_db(&row.get::<_, String>(4)?)?,
    })
}

#[async_trait]
impl BotStore for SqliteBotStore {
    async fn list_followers(&self) -> StoreResult<Vec<FollowerRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {FOLLOWER_COLUMNS} FROM followers ORDER BY user_id ASC"
        ))?;
        let mut rows = statement.query([])?;
        let mut followers = Vec::new();
        while let Some(row) = rows.next()? {
            followers.push(follower_from_row(row)?);
        }
        Ok(followers)
    }

    async fn get_follower(&self, user_id: &str) -> StoreResult<Option<FollowerRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {FOLLOWER_COLUMNS} FROM followers WHERE user_id = ?1"
        ))?;
        let mut rows = statement.query(params![user_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(follower_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn insert_follower(&self, record: FollowerRecord) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO followers
                (user_id, display_name, is_follower, is_following_back, first_seen)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.user_id,
                record.display_name,
                record.is_follower,
                record.is_following_back,
                timestamp_to_db(record.first_seen),
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn delete_follower(&self, user_id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let deleted =
            connection.execute("DELETE FROM followers WHERE user_id = ?1", params![user_id])?;
        Ok(deleted > 0)
    }

    async fn set_following_back(&self, user_id: &str, following_back: bool) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let updated = connection.execute(
            "UPDATE followers SET is_following_back = ?2 WHERE user_id = ?1",
            params![user_id, following_back],
        )?;
        Ok(updated > 0)
    }

    async fn apply_follow_states(&self, updates: &[FollowStateUpdate]) -> StoreResult<usize> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        let mut applied = 0;
        {
            let mut statement = transaction.prepare(
                r#"
                UPDATE followers
                SET is_following_back = ?2,
                    display_name = COALESCE(?3, display_name)
                WHERE user_id = ?1
                "#,
            )?;
            for update in updates {
                applied += statement.execute(params![
                    update.user_id,
                    update.is_following_back,
                    update.display_name,
                ])?;
            }
        }
        transaction.commit()?;
        Ok(applied)
    }

    async fn record_reply(&self, user_id: &str, replied_at: DateTime<Utc>) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "INSERT INTO reply_quota (user_id, replied_at_ms) VALUES (?1, ?2)",
            params![user_id, datetime_to_unix_ms(replied_at)],
        )?;
        Ok(())
    }

    async fn count_replies_between(
        &self,
        user_id: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let connection = self.open_connection()?;
        let count: i64 = connection.query_row(
            r#"
            SELECT COUNT(*) FROM reply_quota
            WHERE user_id = ?1 AND replied_at_ms > ?2 AND replied_at_ms <= ?3
            "#,
            params![
                user_id,
                datetime_to_unix_ms(after),
                datetime_to_unix_ms(until)
            ],
            |row| row.get(0),
        )?;
        i64_to_u64("reply_quota_count", count)
    }

    async fn purge_replies_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        Ok(connection.execute(
            "DELETE FROM reply_quota WHERE replied_at_ms < ?1",
            params![datetime_to_unix_ms(cutoff)],
        )?)
    }

    async fn append_post(&self, post: PostRecord) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO posts (note_id, reply_to, kind, content, posted_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                post.note_id,
                post.reply_to,
                post.kind.as_label(),
                post.content,
                datetime_to_unix_ms(post.posted_at),
            ],
        )?;
        Ok(())
    }

    async fn purge_posts_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        Ok(connection.execute(
            "DELETE FROM posts WHERE posted_at_ms < ?1",
            params![datetime_to_unix_ms(cutoff)],
        )?)
    }

    async fn compact(&self) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute_batch("VACUUM;")?;
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let connection = self.open_connection()?;
        let (followers, mutual_followers): (i64, i64) = connection.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN is_follower = 1 AND is_following_back = 1 THEN 1 ELSE 0 END), 0)
            FROM followers
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (posts, oldest, newest): (i64, Option<i64>, Option<i64>) = connection.query_row(
            "SELECT COUNT(*), MIN(posted_at_ms), MAX(posted_at_ms) FROM posts",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let quota: i64 =
            connection.query_row("SELECT COUNT(*) FROM reply_quota", [], |row| row.get(0))?;
        let database_bytes = std::fs::metadata(&self.db_path)
            .map(|metadata| metadata.len())
            .ok();

        Ok(StoreStats {
            followers: i64_to_u64("followers", followers)?,
            mutual_followers: i64_to_u64("mutual_followers", mutual_followers)?,
            posts: i64_to_u64("posts", posts)?,
            reply_quota_entries: i64_to_u64("reply_quota_entries", quota)?,
            oldest_post_at: oldest.map(datetime_from_unix_ms),
            newest_post_at: newest.map(datetime_from_unix_ms),
            database_bytes,
        })
    }

    async fn backup_to(&self, destination: &Path) -> StoreResult<()> {
        if destination.exists() {
            return Err(BotStoreError::BackupTargetExists(destination.to_path_buf()));
        }
        if let Some(parent) = destination.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let connection = self.open_connection()?;
        connection.execute(
            "VACUUM INTO ?1",
            params![destination.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }
}

impl SqliteBotStore {
    /// Most recent post rows, newest first.
    pub fn recent_posts(&self, limit: usize) -> StoreResult<Vec<PostRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT note_id, reply_to, kind, content, posted_at_ms
            FROM posts
            ORDER BY posted_at_ms DESC, row_id DESC
            LIMIT ?1
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = statement.query(params![limit])?;
        let mut posts = Vec::new();
        while let Some(row) = rows.next()? {
            posts.push(PostRecord {
                note_id: row.get(0)?,
                reply_to: row.get(1)?,
                kind: PostKind::from_label(&row.get::<_, String>(2)?)?,
                content: row.get(3)?,
                posted_at: datetime_from_unix_ms(row.get(4)?),
            });
        }
        Ok(posts)
    }

    /// Whether a follower row exists, without decoding it.
    pub fn has_follower(&self, user_id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        Ok(connection
            .query_row(
                "SELECT 1 FROM followers WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some())
    }
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| BotStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
