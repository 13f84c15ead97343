//! Command-line flags and the TOML bot configuration for the Riina binary.
//!
//! Secrets and paths come from flags or environment variables; behavior
//! (reply policy, posting, maintenance) comes from the config file.

pub mod bot_config;
pub mod cli_args;

pub use bot_config::{load_bot_config, parse_bot_config, BotConfig, ScheduledPosts};
pub use cli_args::Cli;
