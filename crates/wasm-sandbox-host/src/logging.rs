//! Logging host function implementation.
//!
//! This module provides the host-side implementation of `env.log`, allowing
//! guest modules to emit logs that are captured by the runtime.
//!
//! Guest logging is bounded: a message is cut to [`MAX_LOG_MESSAGE_BYTES`],
//! an invocation keeps at most [`MAX_LOG_ENTRIES`] entries, and every call is
//! charged by the bytes it copies before anything is copied.

use tracing::debug;
use wasm_sandbox_core::{InvocationContext, LogLevel};

/// Longest message, in bytes, copied out of guest memory. Longer messages are truncated.
pub const MAX_LOG_MESSAGE_BYTES: usize = 1024;

/// Entries kept per invocation. Later calls are charged and dropped.
pub const MAX_LOG_ENTRIES: usize = 128;

/// Message bytes paid for by one metered operation.
pub const LOG_BYTES_PER_OPERATION: usize = 32;

/// Host implementation for guest logging.
///
/// Logs are both:
/// 1. Stored in the [`InvocationContext`] and returned with the completion
/// 2. Emitted at debug level via the `tracing` crate, with the guest's level
///    as a field
pub struct LoggingHost;

impl LoggingHost {
    /// Operations charged for a call whose message is `len` bytes long.
    ///
    /// One for the call itself, plus one per started [`LOG_BYTES_PER_OPERATION`]
    /// bytes of the part that is actually copied.
    pub fn cost(len: usize) -> u64 {
        let copied = len.min(MAX_LOG_MESSAGE_BYTES);
        1 + u64::try_from(copied.div_ceil(LOG_BYTES_PER_OPERATION)).unwrap_or(u64::MAX)
    }

    /// Returns `true` while the invocation can still keep another entry.
    pub fn has_room(ctx: &InvocationContext) -> bool {
        ctx.logs.len() < MAX_LOG_ENTRIES
    }

    /// Log a message at the specified level.
    ///
    /// Returns `false` if the entry was dropped because the invocation already
    /// holds [`MAX_LOG_ENTRIES`] entries.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The invocation context to store logs in
    /// * `level` - The log level
    /// * `message` - The log message
    pub fn log(ctx: &mut InvocationContext, level: LogLevel, message: &str) -> bool {
        if !Self::has_room(ctx) {
            debug!(
                invocation_id = %ctx.invocation_id,
                max_entries = MAX_LOG_ENTRIES,
                "Guest log dropped"
            );
            return false;
        }

        ctx.log(level, message.to_string());
        debug!(
            invocation_id = %ctx.invocation_id,
            guest_level = ?level,
            guest_log = true,
            "{}",
            message
        );
        true
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// Levels are 0=debug, 1=info, 2=warn, 3=error; unknown values map to Info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}
