//! TOML bot configuration.
//!
//! Every key is optional; omitted keys take the documented defaults so an
//! empty file (or no file at all) yields a working bot.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use riina_misskey::TimelineSource;
use riina_runtime::{default_follow_back_keywords, parse_hh_mm};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotConfig {
    pub bot: BotSection,
    pub reply: ReplySection,
    pub follow: FollowSection,
    pub stream: StreamSection,
    pub mention_poll: MentionPollSection,
    pub posting: PostingSection,
    pub maintenance: MaintenanceSection,
    pub decision_log: DecisionLogSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotSection {
    pub name: String,
    /// IANA zone used for night mode, scheduled slots and backup names.
    pub timezone: String,
    pub character_prompt_file: Option<String>,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            name: "riina".to_string(),
            timezone: "Asia/Tokyo".to_string(),
            character_prompt_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplySection {
    pub enabled: bool,
    pub mutual_only: bool,
    pub rate_limit: RateLimitSection,
}

impl Default for ReplySection {
    fn default() -> Self {
        Self {
            enabled: true,
            mutual_only: true,
            rate_limit: RateLimitSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_per_user_per_hour: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_per_user_per_hour: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FollowSection {
    pub auto_unfollow_back: bool,
    pub check_interval_minutes: u64,
    pub keyword_follow_back: KeywordFollowBackSection,
}

impl Default for FollowSection {
    fn default() -> Self {
        Self {
            auto_unfollow_back: true,
            check_interval_minutes: 30,
            keyword_follow_back: KeywordFollowBackSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordFollowBackSection {
    pub enabled: bool,
    pub keywords: Vec<String>,
}

impl Default for KeywordFollowBackSection {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords: default_follow_back_keywords(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSection {
    /// Consecutive failed attempts tolerated before the connector gives up.
    pub max_reconnect_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            base_delay_secs: 1,
            max_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MentionPollSection {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub limit: usize,
}

impl Default for MentionPollSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 5,
            limit: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostingSection {
    pub default_visibility: String,
    pub random_post: IntervalJobSection,
    pub night_mode: NightModeSection,
    pub timeline_post: TimelinePostSection,
    pub scheduled_posts: ScheduledPostsSection,
}

impl Default for PostingSection {
    fn default() -> Self {
        Self {
            default_visibility: "home".to_string(),
            random_post: IntervalJobSection {
                enabled: true,
                interval_minutes: 60,
            },
            night_mode: NightModeSection::default(),
            timeline_post: TimelinePostSection::default(),
            scheduled_posts: ScheduledPostsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntervalJobSection {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for IntervalJobSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NightModeSection {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for NightModeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 23,
            end_hour: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimelinePostSection {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub source: String,
    pub max_notes_fetch: usize,
    pub min_keyword_length: usize,
    pub ng_words: Vec<String>,
    pub ng_word_urls: Vec<String>,
}

impl Default for TimelinePostSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            source: "home".to_string(),
            max_notes_fetch: 20,
            min_keyword_length: 2,
            ng_words: Vec::new(),
            ng_word_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduledPostsSection {
    pub enabled: bool,
    pub posts: ScheduledPosts,
}

impl Default for ScheduledPostsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            posts: ScheduledPosts::default(),
        }
    }
}

/// Either a `"HH:MM" = [messages]` table or an array of `{ time, messages }`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScheduledPosts {
    ByTime(BTreeMap<String, Vec<String>>),
    Entries(Vec<ScheduledPostEntry>),
}

impl Default for ScheduledPosts {
    fn default() -> Self {
        Self::ByTime(BTreeMap::new())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScheduledPostEntry {
    pub time: String,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ScheduledPosts {
    /// Slots keyed by `HH:MM`. Later array entries for the same slot extend earlier ones.
    pub fn by_time(&self) -> BTreeMap<String, Vec<String>> {
        match self {
            Self::ByTime(map) => map.clone(),
            Self::Entries(entries) => {
                let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for entry in entries {
                    map.entry(entry.time.trim().to_string())
                        .or_default()
                        .extend(entry.messages.iter().cloned());
                }
                map
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceSection {
    pub enabled: bool,
    pub cleanup_time: String,
    pub cleanup_days: u32,
    pub backup_time: String,
    pub keep_backups: usize,
    pub stats_time: String,
    pub backup_on_shutdown: bool,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_time: "03:00".to_string(),
            cleanup_days: 30,
            backup_time: "04:00".to_string(),
            keep_backups: 7,
            stats_time: "06:00".to_string(),
            backup_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionLogSection {
    pub enabled: bool,
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for DecisionLogSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 5 * 1024 * 1024,
            max_files: 3,
        }
    }
}

impl BotConfig {
    pub fn timezone(&self) -> Result<Tz> {
        self.bot
            .timezone
            .parse::<Tz>()
            .map_err(|error| {
                anyhow::anyhow!("invalid bot.timezone '{}': {error}", self.bot.timezone)
            })
    }

    pub fn timeline_source(&self) -> Result<TimelineSource> {
        self.posting
            .timeline_post
            .source
            .parse::<TimelineSource>()
            .map_err(|error| anyhow::anyhow!("posting.timeline_post.source: {error}"))
    }

    pub fn validate(&self) -> Result<()> {
        self.timezone()?;
        self.timeline_source()?;

        let night = &self.posting.night_mode;
        if night.start_hour > 23 || night.end_hour > 23 {
            bail!(
                "posting.night_mode hours must be within 0..=23 (got {}..{})",
                night.start_hour,
                night.end_hour
            );
        }
        if self.reply.rate_limit.max_per_user_per_hour == 0 {
            bail!("reply.rate_limit.max_per_user_per_hour must be greater than 0");
        }
        if self.stream.base_delay_secs == 0
            || self.stream.max_delay_secs < self.stream.base_delay_secs
        {
            bail!("stream delays must satisfy 0 < base_delay_secs <= max_delay_secs");
        }
        if self.mention_poll.enabled && self.mention_poll.limit == 0 {
            bail!("mention_poll.limit must be greater than 0");
        }

        if self.posting.scheduled_posts.enabled {
            for slot in self.posting.scheduled_posts.posts.by_time().keys() {
                parse_hh_mm(slot)
                    .with_context(|| format!("posting.scheduled_posts.posts slot '{slot}'"))?;
            }
        }
        if self.maintenance.enabled {
            for (key, value) in [
                ("maintenance.cleanup_time", &self.maintenance.cleanup_time),
                ("maintenance.backup_time", &self.maintenance.backup_time),
                ("maintenance.stats_time", &self.maintenance.stats_time),
            ] {
                parse_hh_mm(value).context(key)?;
            }
        }
        Ok(())
    }
}

pub fn parse_bot_config(raw: &str) -> Result<BotConfig> {
    let config: BotConfig = toml::from_str(raw).context("failed to parse bot config")?;
    config.validate()?;
    Ok(config)
}

/// Reads and validates `path`. A missing file yields the defaults.
pub fn load_bot_config(path: &Path) -> Result<BotConfig> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "bot config not found; using built-in defaults"
        );
        return Ok(BotConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_bot_config(&raw).with_context(|| format!("invalid bot config {}", path.display()))
}
