use thiserror::Error;

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorCategory {
    Transport,
    RateLimited,
    Client,
    Server,
    Decode,
    Config,
}

impl PlatformErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::RateLimited => "rate_limited",
            Self::Client => "client",
            Self::Server => "server",
            Self::Decode => "decode",
            Self::Config => "config",
        }
    }
}

/// One platform REST call failed.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("misskey {operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("misskey {operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("misskey {operation} returned an unexpected payload: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
    #[error("invalid misskey configuration: {0}")]
    InvalidConfig(String),
}

impl PlatformError {
    pub fn category(&self) -> PlatformErrorCategory {
        match self {
            Self::Status { status: 429, .. } => PlatformErrorCategory::RateLimited,
            Self::Status { status, .. } if *status >= 500 => PlatformErrorCategory::Server,
            Self::Status { .. } => PlatformErrorCategory::Client,
            Self::Transport { .. } => PlatformErrorCategory::Transport,
            Self::Decode { .. } => PlatformErrorCategory::Decode,
            Self::InvalidConfig(_) => PlatformErrorCategory::Config,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}
