use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use riina_store::{BotStore, StoreResult};
use tracing::{debug, warn};

pub const DEFAULT_MAX_REPLIES_PER_WINDOW: u32 = 3;

/// Sliding-window reply quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_per_window: DEFAULT_MAX_REPLIES_PER_WINDOW,
            window: Duration::hours(1),
        }
    }
}

/// Per-user reply limiter backed by the quota rows of a [`BotStore`].
///
/// A reply made exactly `window` ago no longer counts. Store failures deny.
pub struct ReplyRateLimiter {
    store: Arc<dyn BotStore>,
    policy: RateLimitPolicy,
}

impl ReplyRateLimiter {
    pub fn new(store: Arc<dyn BotStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub async fn check(&self, user_id: &str) -> bool {
        self.check_at(user_id, Utc::now()).await
    }

    pub async fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        let window_start = now - self.policy.window;
        match self
            .store
            .count_replies_between(user_id, window_start, now)
            .await
        {
            Ok(count) => {
                let allowed = count < u64::from(self.policy.max_per_window);
                debug!(
                    user_id,
                    count,
                    max = self.policy.max_per_window,
                    allowed,
                    "reply quota checked"
                );
                allowed
            }
            Err(error) => {
                warn!(user_id, error = %error, "reply quota lookup failed; denying");
                false
            }
        }
    }

    pub async fn record(&self, user_id: &str) -> StoreResult<()> {
        self.record_at(user_id, Utc::now()).await
    }

    pub async fn record_at(&self, user_id: &str, replied_at: DateTime<Utc>) -> StoreResult<()> {
        self.store.record_reply(user_id, replied_at).await
    }

    /// Retention sweep for quota rows older than `cutoff`.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.store.purge_replies_before(cutoff).await
    }
}
