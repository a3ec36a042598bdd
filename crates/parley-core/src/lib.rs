//! Foundational low-level utilities shared across Parley crates.
//!
//! Provides atomic file-write helpers for monitor snapshots and interview
//! record exports, plus the millisecond clock used in latency metrics.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{current_unix_timestamp_ms, duration_to_ms};
