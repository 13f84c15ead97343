use std::path::PathBuf;

use clap::Parser;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_temperature(value: &str) -> Result<f32, String> {
    let parsed = value
        .parse::<f32>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || !(0.0..=2.0).contains(&parsed) {
        return Err("value must be in range 0.0..=2.0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "riina-bot",
    about = "Misskey character bot: mention replies, follow reconciliation and scheduled posts",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "RIINA_CONFIG",
        default_value = "config.toml",
        help = "Path to the TOML bot configuration. A missing file falls back to built-in defaults."
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "MISSKEY_INSTANCE_URL",
        help = "Misskey instance origin, e.g. https://misskey.example"
    )]
    pub misskey_instance_url: Option<String>,

    #[arg(
        long,
        env = "MISSKEY_API_TOKEN",
        hide_env_values = true,
        help = "Access token of the bot account"
    )]
    pub misskey_api_token: Option<String>,

    #[arg(
        long,
        env = "GEMINI_API_KEY",
        hide_env_values = true,
        help = "API key for the Gemini generateContent endpoint"
    )]
    pub gemini_api_key: Option<String>,

    #[arg(
        long,
        env = "GEMINI_API_BASE",
        help = "Override the Gemini API base URL"
    )]
    pub gemini_api_base: Option<String>,

    #[arg(
        long,
        env = "GEMINI_MODEL",
        default_value = "gemini-2.5-flash",
        help = "Gemini model used for replies and posts"
    )]
    pub gemini_model: String,

    #[arg(
        long,
        env = "GEMINI_TEMPERATURE",
        default_value_t = 1.0,
        value_parser = parse_temperature,
        help = "Sampling temperature for generated text"
    )]
    pub gemini_temperature: f32,

    #[arg(
        long,
        env = "DATABASE_PATH",
        default_value = "data/riina_bot.db",
        help = "SQLite database holding followers, reply history and posts"
    )]
    pub database_path: PathBuf,

    #[arg(
        long,
        env = "RIINA_STATE_DIR",
        default_value = "data/state",
        help = "Directory for stream health snapshots and the decision log"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long,
        env = "RIINA_BACKUP_DIR",
        default_value = "backups",
        help = "Directory receiving timestamped database backups"
    )]
    pub backup_dir: PathBuf,

    #[arg(
        long,
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "HTTP timeout for Misskey and Gemini requests in milliseconds"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 3,
        value_parser = parse_positive_usize,
        help = "Attempts per Misskey request before a retryable failure is surfaced"
    )]
    pub retry_max_attempts: usize,

    #[arg(
        long,
        default_value_t = 500,
        value_parser = parse_positive_u64,
        help = "Base delay between Misskey retries in milliseconds"
    )]
    pub retry_base_delay_ms: u64,

    #[arg(
        long,
        default_value_t = false,
        conflicts_with = "print_stats",
        help = "Run one follower/following reconciliation, print the report as JSON and exit"
    )]
    pub sync_followers: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Print store statistics and exit"
    )]
    pub print_stats: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn unit_cli_defaults_match_documented_paths() {
        let cli = Cli::try_parse_from(["riina-bot"]).expect("parse defaults");
        assert_eq!(cli.database_path.to_string_lossy(), "data/riina_bot.db");
        assert_eq!(cli.state_dir.to_string_lossy(), "data/state");
        assert_eq!(cli.gemini_model, "gemini-2.5-flash");
        assert_eq!(cli.retry_max_attempts, 3);
        assert!(!cli.sync_followers);
        assert!(!cli.print_stats);
    }

    #[test]
    fn regression_cli_rejects_zero_timeout_and_out_of_range_temperature() {
        let error = Cli::try_parse_from(["riina-bot", "--request-timeout-ms", "0"])
            .expect_err("zero timeout");
        assert!(error.to_string().contains("greater than 0"));

        let error = Cli::try_parse_from(["riina-bot", "--gemini-temperature", "3.5"])
            .expect_err("temperature out of range");
        assert!(error.to_string().contains("0.0..=2.0"));
    }

    #[test]
    fn unit_cli_one_shot_modes_are_exclusive() {
        let error = Cli::try_parse_from(["riina-bot", "--sync-followers", "--print-stats"])
            .expect_err("conflicting modes");
        assert!(error.to_string().contains("cannot be used with"));
    }
}
