//! Autonomous posts: random, timeline-keyword and fixed-time messages.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use riina_ai::TextGenerator;
use riina_core::current_unix_timestamp_ms;
use riina_misskey::{PlatformClient, TimelineNote, TimelineSource};
use riina_store::{BotStore, PostKind, PostRecord};
use tracing::{debug, info, warn};

use crate::ng_words::NgWordFilter;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Tokyo;

/// Hours `[start_hour, end_hour)` during which autonomous posts pause. The
/// range wraps past midnight when `start_hour > end_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightMode {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for NightMode {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 23,
            end_hour: 5,
        }
    }
}

impl NightMode {
    pub fn is_night_hour(&self, hour: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            self.start_hour <= hour && hour < self.end_hour
        }
    }
}

/// Pulls candidate topic words out of timeline notes.
#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    url: Regex,
    mention: Regex,
    custom_emoji: Regex,
    whitespace: Regex,
    min_keyword_length: usize,
}

impl KeywordExtractor {
    pub fn new(min_keyword_length: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            url: Regex::new(r"https?://\S+")?,
            mention: Regex::new(r"@[a-zA-Z0-9_]+")?,
            custom_emoji: Regex::new(r":[a-zA-Z0-9_]+:")?,
            whitespace: Regex::new(r"\s+")?,
            min_keyword_length,
        })
    }

    /// Strips URLs, `@mentions` and `:custom_emoji:`, then collapses whitespace.
    pub fn clean(&self, text: &str) -> String {
        let text = self.url.replace_all(text, "");
        let text = self.mention.replace_all(&text, "");
        let text = self.custom_emoji.replace_all(&text, "");
        self.whitespace.replace_all(&text, " ").trim().to_string()
    }

    /// Unique words in first-seen order.
    pub fn extract(&self, notes: &[TimelineNote], ng_words: &NgWordFilter) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keywords = Vec::new();
        for text in notes.iter().filter_map(|note| note.text.as_deref()) {
            let cleaned = self.clean(text);
            if cleaned.chars().count() < self.min_keyword_length
                || ng_words.contains_ng_word(&cleaned)
            {
                continue;
            }
            for word in cleaned.split_whitespace() {
                if word.chars().count() >= self.min_keyword_length
                    && !ng_words.contains_ng_word(word)
                    && seen.insert(word.to_string())
                {
                    keywords.push(word.to_string());
                }
            }
        }
        keywords
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingPolicy {
    pub night_mode: NightMode,
    pub timezone: Tz,
    pub timeline_source: TimelineSource,
    pub max_notes_fetch: usize,
    pub min_keyword_length: usize,
    /// `HH:MM` slot to candidate messages.
    pub scheduled_messages: BTreeMap<String, Vec<String>>,
}

impl Default for PostingPolicy {
    fn default() -> Self {
        Self {
            night_mode: NightMode::default(),
            timezone: DEFAULT_TIMEZONE,
            timeline_source: TimelineSource::Home,
            max_notes_fetch: 20,
            min_keyword_length: 2,
            scheduled_messages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NightMode,
    TimelineUnavailable,
    NoKeywords,
    NoMessages,
    GenerationFailed,
    NgWord,
    SendFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NightMode => "night-mode",
            Self::TimelineUnavailable => "timeline-unavailable",
            Self::NoKeywords => "no-keywords",
            Self::NoMessages => "no-messages",
            Self::GenerationFailed => "generation-failed",
            Self::NgWord => "ng-word",
            Self::SendFailed => "send-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Posted { note_id: String },
    Skipped(SkipReason),
}

pub struct PostComposer {
    platform: Arc<dyn PlatformClient>,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn BotStore>,
    ng_words: Arc<NgWordFilter>,
    policy: PostingPolicy,
    extractor: KeywordExtractor,
    pick_counter: AtomicU64,
}

impl PostComposer {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn BotStore>,
        ng_words: Arc<NgWordFilter>,
        policy: PostingPolicy,
    ) -> Result<Self, regex::Error> {
        let extractor = KeywordExtractor::new(policy.min_keyword_length)?;
        Ok(Self {
            platform,
            generator,
            store,
            ng_words,
            policy,
            extractor,
            pick_counter: AtomicU64::new(current_unix_timestamp_ms()),
        })
    }

    pub fn policy(&self) -> &PostingPolicy {
        &self.policy
    }

    pub fn is_night_at(&self, now: DateTime<Utc>) -> bool {
        let local_hour = now.with_timezone(&self.policy.timezone).hour();
        self.policy.night_mode.is_night_hour(local_hour)
    }

    pub async fn post_random(&self) -> PostOutcome {
        self.post_random_at(Utc::now()).await
    }

    pub async fn post_random_at(&self, now: DateTime<Utc>) -> PostOutcome {
        if self.is_night_at(now) {
            info!("night mode; random post skipped");
            return PostOutcome::Skipped(SkipReason::NightMode);
        }
        let Some(text) = self.generator.generate_post(None).await else {
            return self.skipped("random", SkipReason::GenerationFailed);
        };
        if self.ng_words.contains_ng_word(&text) {
            return self.skipped("random", SkipReason::NgWord);
        }
        self.publish(PostKind::Random, text).await
    }

    pub async fn post_timeline(&self) -> PostOutcome {
        self.post_timeline_at(Utc::now()).await
    }

    pub async fn post_timeline_at(&self, now: DateTime<Utc>) -> PostOutcome {
        if self.is_night_at(now) {
            info!("night mode; timeline post skipped");
            return PostOutcome::Skipped(SkipReason::NightMode);
        }
        let notes = match self
            .platform
            .fetch_timeline(self.policy.timeline_source, self.policy.max_notes_fetch)
            .await
        {
            Ok(notes) => notes,
            Err(error) => {
                warn!(
                    source = self.policy.timeline_source.endpoint(),
                    error = %error,
                    "timeline fetch failed"
                );
                return PostOutcome::Skipped(SkipReason::TimelineUnavailable);
            }
        };
        let keywords = self.extractor.extract(&notes, &self.ng_words);
        debug!(notes = notes.len(), keywords = keywords.len(), "timeline keywords extracted");
        let Some(keyword) = self.pick(&keywords) else {
            return self.skipped("timeline", SkipReason::NoKeywords);
        };
        info!(keyword = %keyword, "timeline keyword selected");
        let Some(text) = self.generator.generate_post(Some(keyword.as_str())).await else {
            return self.skipped("timeline", SkipReason::GenerationFailed);
        };
        if self.ng_words.contains_ng_word(&text) {
            return self.skipped("timeline", SkipReason::NgWord);
        }
        self.publish(PostKind::Timeline, text).await
    }

    /// Fixed-time post for the `HH:MM` slot. Night mode does not apply.
    pub async fn post_scheduled(&self, slot: &str) -> PostOutcome {
        let messages = self
            .policy
            .scheduled_messages
            .get(slot)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(text) = self.pick(messages) else {
            warn!(slot, "no scheduled messages configured");
            return PostOutcome::Skipped(SkipReason::NoMessages);
        };
        self.publish(PostKind::Scheduled(slot.to_string()), text.clone())
            .await
    }

    async fn publish(&self, kind: PostKind, text: String) -> PostOutcome {
        let label = kind.as_label();
        let note_id = match self.platform.send_post(&text, None).await {
            Ok(note_id) => note_id,
            Err(error) => {
                warn!(kind = %label, error = %error, "post send failed");
                return PostOutcome::Skipped(SkipReason::SendFailed);
            }
        };
        let record = PostRecord {
            note_id: note_id.clone(),
            reply_to: None,
            kind,
            content: text,
            posted_at: Utc::now(),
        };
        if let Err(error) = self.store.append_post(record).await {
            warn!(note_id = %note_id, error = %error, "failed to record post history");
        }
        info!(kind = %label, note_id = %note_id, "posted");
        PostOutcome::Posted { note_id }
    }

    fn skipped(&self, kind: &str, reason: SkipReason) -> PostOutcome {
        info!(kind, reason = reason.as_str(), "post skipped");
        PostOutcome::Skipped(reason)
    }

    fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let seed = self.pick_counter.fetch_add(1, Ordering::Relaxed);
        let mixed =
            seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
        let index = usize::try_from(mixed % items.len() as u64).unwrap_or(0);
        items.get(index)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use riina_store::InMemoryBotStore;

    use super::*;
    use crate::test_support::{ScriptedGenerator, ScriptedPlatform};

    fn note(id: &str, text: &str) -> TimelineNote {
        TimelineNote {
            id: id.to_string(),
            author_id: "someone".to_string(),
            text: Some(text.to_string()),
        }
    }

    fn composer(
        platform: Arc<ScriptedPlatform>,
        generator: Arc<ScriptedGenerator>,
        store: Arc<InMemoryBotStore>,
        ng_words: &[&str],
        policy: PostingPolicy,
    ) -> PostComposer {
        PostComposer::new(
            platform,
            generator,
            store,
            Arc::new(NgWordFilter::new(ng_words)),
            policy,
        )
        .expect("composer")
    }

    // 03:00 UTC is 12:00 in Tokyo; 15:00 UTC is 00:00.
    fn tokyo_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).single().expect("time")
    }

    fn tokyo_midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 15, 0, 0).single().expect("time")
    }

    #[test]
    fn unit_night_mode_wraps_past_midnight() {
        let night = NightMode::default();
        let hours: Vec<u32> = (0..24).filter(|hour| night.is_night_hour(*hour)).collect();
        assert_eq!(hours, vec![0, 1, 2, 3, 4, 23]);

        let daytime = NightMode {
            enabled: true,
            start_hour: 12,
            end_hour: 14,
        };
        assert!(daytime.is_night_hour(13));
        assert!(!daytime.is_night_hour(14));
        assert!(!NightMode {
            enabled: false,
            ..NightMode::default()
        }
        .is_night_hour(23));
    }

    #[test]
    fn unit_keyword_extraction_cleans_and_filters() {
        let extractor = KeywordExtractor::new(2).expect("extractor");
        let ng = NgWordFilter::new(["spam"]);
        let notes = vec![
            note("1", "@alice 今日は :blobcat: ラーメン https://example.com/x 食べた"),
            note("2", "spam spam"),
            note("3", "ラーメン a 最高"),
            TimelineNote {
                id: "4".to_string(),
                author_id: "x".to_string(),
                text: None,
            },
        ];

        assert_eq!(
            extractor.clean("@alice hi :blobcat:\n\nhttps://example.com  there"),
            "hi there"
        );
        assert_eq!(
            extractor.extract(&notes, &ng),
            vec!["今日は", "ラーメン", "食べた", "最高"]
        );
    }

    #[tokio::test]
    async fn functional_random_post_is_sent_and_recorded() {
        let platform = Arc::new(ScriptedPlatform::default());
        let store = Arc::new(InMemoryBotStore::new());
        let composer = composer(
            platform.clone(),
            Arc::new(ScriptedGenerator::always("いい天気")),
            store.clone(),
            &[],
            PostingPolicy::default(),
        );

        let outcome = composer.post_random_at(tokyo_noon()).await;

        assert_eq!(
            outcome,
            PostOutcome::Posted {
                note_id: "note-1".to_string()
            }
        );
        assert_eq!(platform.sent(), vec![("いい天気".to_string(), None)]);
        let posts = store.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].kind, PostKind::Random);
    }

    #[tokio::test]
    async fn functional_night_mode_suppresses_autonomous_posts() {
        let platform = Arc::new(ScriptedPlatform::default());
        let generator = Arc::new(ScriptedGenerator::always("zzz"));
        let composer = composer(
            platform.clone(),
            generator.clone(),
            Arc::new(InMemoryBotStore::new()),
            &[],
            PostingPolicy::default(),
        );

        assert_eq!(
            composer.post_random_at(tokyo_midnight()).await,
            PostOutcome::Skipped(SkipReason::NightMode)
        );
        assert_eq!(
            composer.post_timeline_at(tokyo_midnight()).await,
            PostOutcome::Skipped(SkipReason::NightMode)
        );
        assert!(platform.calls().is_empty());
        assert!(generator.post_topics.lock().expect("topics").is_empty());
    }

    #[tokio::test]
    async fn regression_ng_word_in_generated_text_blocks_post() {
        let platform = Arc::new(ScriptedPlatform::default());
        let composer = composer(
            platform.clone(),
            Arc::new(ScriptedGenerator::always("これはSPAMです")),
            Arc::new(InMemoryBotStore::new()),
            &["spam"],
            PostingPolicy::default(),
        );

        assert_eq!(
            composer.post_random_at(tokyo_noon()).await,
            PostOutcome::Skipped(SkipReason::NgWord)
        );
        assert!(platform.sent().is_empty());
    }

    #[tokio::test]
    async fn functional_timeline_post_uses_extracted_keyword() {
        let platform = Arc::new(ScriptedPlatform::default());
        *platform.timeline.lock().expect("timeline") = vec![note("n1", "@bob ラーメン")];
        let generator = Arc::new(ScriptedGenerator::always("ラーメン食べたい"));
        let store = Arc::new(InMemoryBotStore::new());
        let composer = composer(
            platform.clone(),
            generator.clone(),
            store.clone(),
            &[],
            PostingPolicy {
                timeline_source: TimelineSource::Local,
                ..PostingPolicy::default()
            },
        );

        let outcome = composer.post_timeline_at(tokyo_noon()).await;

        assert!(matches!(outcome, PostOutcome::Posted { .. }));
        assert_eq!(
            generator.post_topics.lock().expect("topics").clone(),
            vec![Some("ラーメン".to_string())]
        );
        assert!(platform
            .calls()
            .contains(&"fetch_timeline:notes/local-timeline".to_string()));
        assert_eq!(store.posts().await[0].kind, PostKind::Timeline);
    }

    #[tokio::test]
    async fn unit_timeline_without_keywords_skips() {
        let platform = Arc::new(ScriptedPlatform::default());
        *platform.timeline.lock().expect("timeline") = vec![note("n1", "https://example.com a")];
        let composer = composer(
            platform.clone(),
            Arc::new(ScriptedGenerator::always("x")),
            Arc::new(InMemoryBotStore::new()),
            &[],
            PostingPolicy::default(),
        );

        assert_eq!(
            composer.post_timeline_at(tokyo_noon()).await,
            PostOutcome::Skipped(SkipReason::NoKeywords)
        );
    }

    #[tokio::test]
    async fn functional_scheduled_post_sends_configured_message() {
        let platform = Arc::new(ScriptedPlatform::default());
        let store = Arc::new(InMemoryBotStore::new());
        let mut scheduled_messages = BTreeMap::new();
        scheduled_messages.insert(
            "07:30".to_string(),
            vec!["おはよう".to_string(), "朝だよ".to_string()],
        );
        let composer = composer(
            platform.clone(),
            Arc::new(ScriptedGenerator::unavailable()),
            store.clone(),
            &[],
            PostingPolicy {
                scheduled_messages,
                ..PostingPolicy::default()
            },
        );

        let outcome = composer.post_scheduled("07:30").await;
        let missing = composer.post_scheduled("12:00").await;

        assert!(matches!(outcome, PostOutcome::Posted { .. }));
        assert_eq!(missing, PostOutcome::Skipped(SkipReason::NoMessages));
        let sent = platform.sent();
        assert_eq!(sent.len(), 1);
        assert!(["おはよう", "朝だよ"].contains(&sent[0].0.as_str()));
        assert_eq!(
            store.posts().await[0].kind,
            PostKind::Scheduled("07:30".to_string())
        );
    }
}
