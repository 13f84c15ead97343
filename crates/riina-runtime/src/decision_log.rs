use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use riina_core::{append_line_with_rotation, current_unix_timestamp_ms, LogRotationPolicy};
use serde::{Deserialize, Serialize};

pub const DECISION_LOG_FILE_NAME: &str = "decisions.jsonl";

/// One NDJSON line describing what the runtime decided about an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp_unix_ms: u64,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DecisionRecord {
    pub fn new(stage: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            stage: stage.into(),
            mention_id: None,
            user_id: None,
            via: None,
            outcome: outcome.into(),
            reason: None,
            detail: None,
        }
    }

    pub fn with_mention(mut self, mention_id: &str, user_id: &str, via: &str) -> Self {
        self.mention_id = Some(mention_id.to_string());
        self.user_id = Some(user_id.to_string());
        self.via = Some(via.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only decision log with size-based rotation.
#[derive(Debug)]
pub struct DecisionLog {
    path: PathBuf,
    rotation: LogRotationPolicy,
    write_lock: Mutex<()>,
}

impl DecisionLog {
    pub fn open(path: impl Into<PathBuf>, rotation: LogRotationPolicy) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        Ok(Self {
            path,
            rotation,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &DecisionRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to encode decision record")?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("decision log lock poisoned"))?;
        append_line_with_rotation(&self.path, &line, self.rotation)
            .with_context(|| format!("failed to append {}", self.path.display()))
    }
}
