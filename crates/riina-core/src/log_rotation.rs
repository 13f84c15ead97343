use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;
const MAX_BYTES_ENV: &str = "RIINA_LOG_ROTATION_MAX_BYTES";
const MAX_FILES_ENV: &str = "RIINA_LOG_ROTATION_MAX_FILES";

/// Size-based rotation settings for append-only NDJSON logs.
///
/// `max_files` counts the active file plus its numbered backups (`log.1`,
/// `log.2`, ...). A zero in either field disables rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Applies `RIINA_LOG_ROTATION_MAX_BYTES` / `RIINA_LOG_ROTATION_MAX_FILES`
    /// over `self`. Unparseable or zero values are ignored.
    pub fn with_env_overrides(self) -> Self {
        Self {
            max_bytes: positive_env_value(MAX_BYTES_ENV).unwrap_or(self.max_bytes),
            max_files: positive_env_value(MAX_FILES_ENV).unwrap_or(self.max_files),
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

fn positive_env_value<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

/// Appends one line to `path`, rotating first when the write would push the
/// active file past `policy.max_bytes`.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if policy.is_enabled() {
        if let Ok(metadata) = std::fs::metadata(path) {
            let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
            if metadata.len().saturating_add(incoming) > policy.max_bytes {
                shift_backups(path, policy.max_files)?;
            }
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

fn shift_backups(path: &Path, max_files: usize) -> Result<()> {
    if max_files <= 1 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()));
    }

    let oldest = max_files - 1;
    let oldest_path = backup_path(path, oldest);
    if oldest_path.exists() {
        std::fs::remove_file(&oldest_path)
            .with_context(|| format!("failed to drop {}", oldest_path.display()))?;
    }
    for index in (1..oldest).rev() {
        let source = backup_path(path, index);
        if source.exists() {
            let destination = backup_path(path, index + 1);
            std::fs::rename(&source, &destination).with_context(|| {
                format!("failed to shift {} to {}", source.display(), destination.display())
            })?;
        }
    }
    let first = backup_path(path, 1);
    std::fs::rename(path, &first)
        .with_context(|| format!("failed to rotate {} to {}", path.display(), first.display()))
}
