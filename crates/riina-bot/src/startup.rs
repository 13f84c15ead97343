use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use riina_ai::{GenerationSettings, GoogleClient, GoogleConfig, LlmTextGenerator};
use riina_cli::{load_bot_config, BotConfig, Cli};
use riina_core::LogRotationPolicy;
use riina_misskey::{MisskeyClient, MisskeyConfig, PlatformClient};
use riina_runtime::{
    build_ng_word_filter, AdmissionPolicy, BotRuntime, FollowReconciler, JobSettings,
    MaintenancePolicy, MentionPollSettings, NightMode, PostingPolicy, RateLimitPolicy,
    ReconcilerPolicy, ReconnectPolicy, RuntimeDependencies, RuntimeSettings,
    WebSocketTransport, DEFAULT_DEDUP_CAPACITY,
};
use riina_store::{BotStore, SqliteBotStore};
use tracing::info;

use crate::bootstrap_helpers::shutdown_signal;

const REPLY_RATE_WINDOW: Duration = Duration::from_secs(60 * 60);

fn minutes(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value * 60))
}

/// Maps the behavior file and CLI paths onto per-component policies.
pub(crate) fn build_runtime_settings(config: &BotConfig, cli: &Cli) -> Result<RuntimeSettings> {
    let timezone = config.timezone()?;
    let timeline_source = config.timeline_source()?;

    let scheduled_messages = if config.posting.scheduled_posts.enabled {
        config
            .posting
            .scheduled_posts
            .posts
            .by_time()
            .into_iter()
            .filter(|(_, messages)| !messages.is_empty())
            .collect()
    } else {
        Default::default()
    };

    let posting = PostingPolicy {
        night_mode: NightMode {
            enabled: config.posting.night_mode.enabled,
            start_hour: config.posting.night_mode.start_hour,
            end_hour: config.posting.night_mode.end_hour,
        },
        timezone,
        timeline_source,
        max_notes_fetch: config.posting.timeline_post.max_notes_fetch,
        min_keyword_length: config.posting.timeline_post.min_keyword_length,
        scheduled_messages,
    };

    let maintenance = &config.maintenance;
    let jobs = JobSettings {
        follow_sync_interval: minutes(config.follow.check_interval_minutes),
        mention_poll: config.mention_poll.enabled.then(|| MentionPollSettings {
            interval: Duration::from_secs(config.mention_poll.interval_minutes.max(1) * 60),
            limit: config.mention_poll.limit,
        }),
        random_post_interval: config
            .posting
            .random_post
            .enabled
            .then(|| minutes(config.posting.random_post.interval_minutes))
            .flatten(),
        timeline_post_interval: config
            .posting
            .timeline_post
            .enabled
            .then(|| minutes(config.posting.timeline_post.interval_minutes))
            .flatten(),
        scheduled_post_times: posting.scheduled_messages.keys().cloned().collect(),
        cleanup_at: maintenance.enabled.then(|| maintenance.cleanup_time.clone()),
        backup_at: maintenance.enabled.then(|| maintenance.backup_time.clone()),
        stats_at: maintenance.enabled.then(|| maintenance.stats_time.clone()),
    };

    Ok(RuntimeSettings {
        admission: AdmissionPolicy {
            replies_enabled: config.reply.enabled,
            mutual_only: config.reply.mutual_only,
            keyword_follow_back: config.follow.keyword_follow_back.enabled,
            follow_back_keywords: config.follow.keyword_follow_back.keywords.clone(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            bot_user_id: None,
        },
        rate_limit: RateLimitPolicy {
            max_per_window: config.reply.rate_limit.max_per_user_per_hour,
            window: chrono::Duration::from_std(REPLY_RATE_WINDOW)
                .expect("reply rate window fits in chrono::Duration"),
        },
        reconciler: ReconcilerPolicy {
            auto_unfollow_back: config.follow.auto_unfollow_back,
        },
        reconnect: ReconnectPolicy {
            max_consecutive_failures: config.stream.max_reconnect_attempts,
            base_delay: Duration::from_secs(config.stream.base_delay_secs),
            max_delay: Duration::from_secs(config.stream.max_delay_secs),
        },
        maintenance: maintenance.enabled.then(|| MaintenancePolicy {
            retention_days: maintenance.cleanup_days,
            backup_dir: cli.backup_dir.clone(),
            keep_backups: maintenance.keep_backups,
            timezone,
        }),
        posting,
        jobs,
        state_dir: Some(cli.state_dir.clone()),
        decision_log: config.decision_log.enabled.then(|| {
            LogRotationPolicy {
                max_bytes: config.decision_log.max_bytes,
                max_files: config.decision_log.max_files,
            }
            .with_env_overrides()
        }),
        initial_sync: true,
        backup_on_shutdown: maintenance.enabled && maintenance.backup_on_shutdown,
    })
}

fn build_misskey_client(cli: &Cli, config: &BotConfig) -> Result<MisskeyClient> {
    let instance_url = cli
        .misskey_instance_url
        .clone()
        .context("--misskey-instance-url (MISSKEY_INSTANCE_URL) is required")?;
    let api_token = cli
        .misskey_api_token
        .clone()
        .context("--misskey-api-token (MISSKEY_API_TOKEN) is required")?;
    MisskeyClient::new(MisskeyConfig {
        instance_url,
        api_token,
        default_visibility: config.posting.default_visibility.clone(),
        request_timeout_ms: cli.request_timeout_ms,
        retry_max_attempts: cli.retry_max_attempts,
        retry_base_delay_ms: cli.retry_base_delay_ms,
    })
    .context("failed to build Misskey client")
}

fn load_character_prompt(path: Option<&str>) -> Result<String> {
    let Some(path) = path else {
        return Ok(String::new());
    };
    std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read character prompt {path}"))
}

fn build_text_generator(cli: &Cli, config: &BotConfig) -> Result<LlmTextGenerator> {
    let api_key = cli
        .gemini_api_key
        .clone()
        .context("--gemini-api-key (GEMINI_API_KEY) is required")?;
    let mut google = GoogleConfig::with_api_key(api_key);
    if let Some(api_base) = &cli.gemini_api_base {
        google.api_base = api_base.clone();
    }
    google.request_timeout_ms = cli.request_timeout_ms;
    let client = GoogleClient::new(google).context("failed to build Gemini client")?;

    let character_prompt = load_character_prompt(config.bot.character_prompt_file.as_deref())?;
    info!(
        prompt_chars = character_prompt.chars().count(),
        model = %cli.gemini_model,
        "text generator ready"
    );
    Ok(LlmTextGenerator::new(
        Arc::new(client),
        GenerationSettings {
            model: cli.gemini_model.clone(),
            character_prompt,
            temperature: cli.gemini_temperature,
            ..GenerationSettings::default()
        },
    ))
}

fn open_store(cli: &Cli) -> Result<Arc<SqliteBotStore>> {
    let store = SqliteBotStore::new(&cli.database_path)
        .with_context(|| format!("failed to open database {}", cli.database_path.display()))?;
    Ok(Arc::new(store))
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = load_bot_config(&cli.config)?;
    let store = open_store(&cli)?;

    if cli.print_stats {
        let stats = store.stats().await.context("failed to read store stats")?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let platform = Arc::new(build_misskey_client(&cli, &config)?);

    if cli.sync_followers {
        let reconciler = FollowReconciler::new(
            platform,
            store,
            ReconcilerPolicy {
                auto_unfollow_back: config.follow.auto_unfollow_back,
            },
        );
        let report = reconciler.run_full_sync().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let own_user = platform
        .verify_credentials()
        .await
        .context("failed to verify Misskey credentials")?;
    info!(
        user_id = %own_user.id,
        username = %own_user.username,
        bot = %config.bot.name,
        "authenticated"
    );

    let generator = Arc::new(build_text_generator(&cli, &config)?);
    let ng_words = build_ng_word_filter(
        &config.posting.timeline_post.ng_words,
        &config.posting.timeline_post.ng_word_urls,
    )
    .await;
    let transport = WebSocketTransport::new(
        platform
            .streaming_url()
            .context("failed to derive streaming url")?,
    );

    let mut settings = build_runtime_settings(&config, &cli)?;
    settings.admission.bot_user_id = Some(own_user.id);
    std::fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("failed to create {}", cli.state_dir.display()))?;

    let runtime = BotRuntime::assemble(
        RuntimeDependencies {
            platform,
            store,
            generator,
            transport: Arc::new(transport),
            ng_words: Arc::new(ng_words),
        },
        settings,
    )?;
    runtime.run_until_shutdown(shutdown_signal()).await
}
