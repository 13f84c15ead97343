//! Decides whether and how the bot reacts to one mention.
//!
//! Steps run in a fixed order and the first one that decides wins: dedup,
//! keyword follow-back, permission gate, rate gate, then generate and send.
//! Nothing a single mention does can fail the caller; every outcome is a value.
//! Mentions from one author take the reply path one at a time, so the quota
//! check and the quota record never interleave.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use riina_ai::TextGenerator;
use riina_misskey::{MentionEvent, PlatformClient};
use riina_store::{BotStore, PostKind, PostRecord};
use tracing::{debug, info, warn};

use crate::decision_log::{DecisionLog, DecisionRecord};
use crate::follow_reconciler::FollowReconciler;
use crate::rate_limiter::ReplyRateLimiter;

pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

pub fn default_follow_back_keywords() -> Vec<String> {
    [
        "フォロー",
        "ふぉろー",
        "フォローバック",
        "フォロバ",
        "フォローして",
        "ふぉろーして",
    ]
    .iter()
    .map(|keyword| keyword.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub replies_enabled: bool,
    /// Only reply to accounts in a mutual follow with the bot.
    pub mutual_only: bool,
    pub keyword_follow_back: bool,
    pub follow_back_keywords: Vec<String>,
    pub dedup_capacity: usize,
    /// The bot's own account id; its notes are never answered.
    pub bot_user_id: Option<String>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            replies_enabled: true,
            mutual_only: true,
            keyword_follow_back: true,
            follow_back_keywords: default_follow_back_keywords(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            bot_user_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    SelfAuthored,
    FollowBackFailed,
    RepliesDisabled,
    Unauthorized,
    RateLimited,
    GenerationFailed,
    SendFailed,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "unread-duplicate",
            Self::SelfAuthored => "self-authored",
            Self::FollowBackFailed => "follow-back-failed",
            Self::RepliesDisabled => "replies-disabled",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate-limited",
            Self::GenerationFailed => "generation-failed",
            Self::SendFailed => "send-failed",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Replied { post_id: String },
    FollowedBack,
    Dropped(DropReason),
}

impl AdmissionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied { .. } => "replied",
            Self::FollowedBack => "followed-back",
            Self::Dropped(_) => "dropped",
        }
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Self::Dropped(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Bounded set of recently seen mention ids. The oldest id is evicted first.
#[derive(Debug)]
pub struct RecentMentionCache {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentMentionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Marks `mention_id` as seen. Returns `false` when it already was.
    pub fn insert(&mut self, mention_id: &str) -> bool {
        if self.seen.contains(mention_id) {
            return false;
        }
        self.order.push_back(mention_id.to_string());
        self.seen.insert(mention_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, mention_id: &str) -> bool {
        self.seen.contains(mention_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct MentionAdmission {
    policy: AdmissionPolicy,
    recent: Mutex<RecentMentionCache>,
    reconciler: Arc<FollowReconciler>,
    limiter: Arc<ReplyRateLimiter>,
    generator: Arc<dyn TextGenerator>,
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn BotStore>,
    decision_log: Option<Arc<DecisionLog>>,
    author_turns: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MentionAdmission {
    pub fn new(
        policy: AdmissionPolicy,
        reconciler: Arc<FollowReconciler>,
        limiter: Arc<ReplyRateLimiter>,
        generator: Arc<dyn TextGenerator>,
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn BotStore>,
    ) -> Self {
        let recent = Mutex::new(RecentMentionCache::new(policy.dedup_capacity));
        Self {
            policy,
            recent,
            reconciler,
            limiter,
            generator,
            platform,
            store,
            decision_log: None,
            author_turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_decision_log(mut self, decision_log: Arc<DecisionLog>) -> Self {
        self.decision_log = Some(decision_log);
        self
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub async fn admit_mention(&self, event: &MentionEvent) -> AdmissionOutcome {
        let outcome = self.evaluate(event).await;
        match &outcome {
            AdmissionOutcome::Dropped(reason) => info!(
                mention_id = %event.mention_id,
                user_id = %event.author_id,
                via = event.received_via.as_str(),
                reason = reason.as_str(),
                "mention dropped"
            ),
            AdmissionOutcome::Replied { post_id } => info!(
                mention_id = %event.mention_id,
                user_id = %event.author_id,
                post_id = %post_id,
                "replied to mention"
            ),
            AdmissionOutcome::FollowedBack => info!(
                mention_id = %event.mention_id,
                user_id = %event.author_id,
                "keyword follow-back; reply skipped"
            ),
        }
        self.log_decision(event, &outcome);
        outcome
    }

    async fn evaluate(&self, event: &MentionEvent) -> AdmissionOutcome {
        if !self.mark_seen(&event.mention_id) {
            return AdmissionOutcome::Dropped(DropReason::Duplicate);
        }
        if self.policy.bot_user_id.as_deref() == Some(event.author_id.as_str()) {
            return AdmissionOutcome::Dropped(DropReason::SelfAuthored);
        }

        if self.policy.keyword_follow_back && self.contains_follow_keyword(&event.text) {
            if let Some(outcome) = self.try_keyword_follow_back(event).await {
                return outcome;
            }
        }

        if !self.policy.replies_enabled {
            return AdmissionOutcome::Dropped(DropReason::RepliesDisabled);
        }
        if self.policy.mutual_only && !self.is_mutual(&event.author_id).await {
            return AdmissionOutcome::Dropped(DropReason::Unauthorized);
        }

        let turn = self.author_turn(&event.author_id);
        let outcome = {
            let _held = turn.lock().await;
            self.reply_within_quota(event).await
        };
        drop(turn);
        self.release_author_turn(&event.author_id);
        outcome
    }

    /// Rate gate, generate, send and record. Callers hold the author's turn.
    async fn reply_within_quota(&self, event: &MentionEvent) -> AdmissionOutcome {
        if !self.limiter.check(&event.author_id).await {
            return AdmissionOutcome::Dropped(DropReason::RateLimited);
        }

        let Some(reply) = self
            .generator
            .generate_reply(&event.text, &event.author_name)
            .await
        else {
            return AdmissionOutcome::Dropped(DropReason::GenerationFailed);
        };
        let post_id = match self
            .platform
            .send_post(&reply, Some(&event.mention_id))
            .await
        {
            Ok(post_id) => post_id,
            Err(error) => {
                warn!(
                    mention_id = %event.mention_id,
                    category = error.category().as_str(),
                    error = %error,
                    "reply send failed"
                );
                return AdmissionOutcome::Dropped(DropReason::SendFailed);
            }
        };

        if let Err(error) = self.limiter.record(&event.author_id).await {
            warn!(user_id = %event.author_id, error = %error, "failed to record reply quota");
        }
        let post = PostRecord {
            note_id: post_id.clone(),
            reply_to: Some(event.mention_id.clone()),
            kind: PostKind::Reply,
            content: reply,
            posted_at: Utc::now(),
        };
        if let Err(error) = self.store.append_post(post).await {
            warn!(post_id = %post_id, error = %error, "failed to record reply history");
        }
        AdmissionOutcome::Replied { post_id }
    }

    fn author_turn(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.author_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_author_turn(&self, user_id: &str) {
        let mut turns = self
            .author_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // only the map itself still holds it: nobody is waiting
        if turns
            .get(user_id)
            .is_some_and(|turn| Arc::strong_count(turn) == 1)
        {
            turns.remove(user_id);
        }
    }

    fn mark_seen(&self, mention_id: &str) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mention_id)
    }

    fn contains_follow_keyword(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.policy
            .follow_back_keywords
            .iter()
            .filter(|keyword| !keyword.trim().is_empty())
            .any(|keyword| text.contains(&keyword.to_lowercase()))
    }

    /// `None` means the keyword does not apply and the mention continues to
    /// the reply path.
    async fn try_keyword_follow_back(&self, event: &MentionEvent) -> Option<AdmissionOutcome> {
        let record = match self.reconciler.follower(&event.author_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(user_id = %event.author_id, "follow keyword from non-follower");
                return None;
            }
            Err(error) => {
                warn!(user_id = %event.author_id, error = %error, "follower lookup failed");
                return None;
            }
        };
        if record.is_following_back {
            return None;
        }
        match self.reconciler.follow_back(&event.author_id).await {
            Ok(()) => Some(AdmissionOutcome::FollowedBack),
            Err(error) => {
                warn!(user_id = %event.author_id, error = %error, "keyword follow-back failed");
                Some(AdmissionOutcome::Dropped(DropReason::FollowBackFailed))
            }
        }
    }

    async fn is_mutual(&self, user_id: &str) -> bool {
        match self.reconciler.follower(user_id).await {
            Ok(record) => record.is_some_and(|record| record.is_mutual()),
            Err(error) => {
                warn!(user_id, error = %error, "follower lookup failed; treating as unauthorized");
                false
            }
        }
    }

    fn log_decision(&self, event: &MentionEvent, outcome: &AdmissionOutcome) {
        let Some(log) = &self.decision_log else {
            return;
        };
        let mut record = DecisionRecord::new("admission", outcome.label()).with_mention(
            &event.mention_id,
            &event.author_id,
            event.received_via.as_str(),
        );
        match outcome {
            AdmissionOutcome::Dropped(reason) => record = record.with_reason(reason.as_str()),
            AdmissionOutcome::Replied { post_id } => {
                record = record.with_detail(format!("post_id={post_id}"))
            }
            AdmissionOutcome::FollowedBack => {}
        }
        if let Err(error) = log.append(&record) {
            warn!(error = %error, "failed to append decision log");
        }
    }
}
