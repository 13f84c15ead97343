//! Low-level helpers shared by the Riina crates.
//!
//! Wall-clock conversions, crash-safe state file writes and the size-rotated
//! NDJSON appender used by the decision log.

pub mod atomic_io;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use log_rotation::{append_line_with_rotation, LogRotationPolicy};
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, datetime_from_unix_ms,
    datetime_to_unix_ms,
};
