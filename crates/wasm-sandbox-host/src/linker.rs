//! Host function registration for Wasmtime linkers.
//!
//! This module registers the host imports guest modules may link against.
//! Every import charges the invocation's meter before doing any work, one
//! operation for the call plus the bytes it will copy out of guest memory.

use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use wasm_sandbox_common::RuntimeError;
use wasm_sandbox_core::{InvocationContext, MEMORY_EXPORT};

use crate::logging::{LoggingHost, MAX_LOG_MESSAGE_BYTES, level_from_i32};

/// Module name all host imports live under.
pub const HOST_MODULE: &str = "env";

/// Raised by `env::abort`. Surfaces to the caller as a trap reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("guest aborted: {message}")]
pub struct GuestAbort {
    /// Message supplied by the guest.
    pub message: String,
}

/// Register all standard host functions on a linker.
///
/// This registers the following host functions:
/// - `env::log` - Logging function for guest code
/// - `env::abort` - Explicit guest abort with a message
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<InvocationContext>) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    register_abort(linker)?;
    Ok(())
}

/// Register the logging host function.
///
/// Registers `env::log(level: i32, ptr: i32, len: i32)` which allows guest
/// code to emit logs at various levels (debug, info, warn, error).
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Pointer to the message string in guest memory
/// - `len`: Length of the message in bytes (UTF-8)
///
/// Only the first [`MAX_LOG_MESSAGE_BYTES`] bytes are copied. A region that
/// cannot be read, or a call made once the invocation's log is full, is
/// dropped; the call is still charged.
pub fn register_logging(linker: &mut Linker<InvocationContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            HOST_MODULE,
            "log",
            |mut caller: Caller<'_, InvocationContext>,
             level: i32,
             ptr: i32,
             len: i32|
             -> wasmtime::Result<()> {
                charge_host_call(&mut caller, len)?;

                if !LoggingHost::has_room(caller.data()) {
                    debug!(invocation_id = %caller.data().invocation_id, "Guest log full");
                    return Ok(());
                }

                let Some(message) = read_guest_str(&mut caller, ptr, len) else {
                    return Ok(());
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
                Ok(())
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register the abort host function.
///
/// Registers `env::abort(ptr: i32, len: i32)`. It never returns to the guest:
/// the invocation ends as a trap whose reason carries the guest's message,
/// truncated like a log message.
pub fn register_abort(linker: &mut Linker<InvocationContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            HOST_MODULE,
            "abort",
            |mut caller: Caller<'_, InvocationContext>,
             ptr: i32,
             len: i32|
             -> wasmtime::Result<()> {
                charge_host_call(&mut caller, len)?;

                let message =
                    read_guest_str(&mut caller, ptr, len).unwrap_or_else(|| "<unreadable>".into());
                debug!(
                    invocation_id = %caller.data().invocation_id,
                    message = %message,
                    "Guest requested abort"
                );
                Err(GuestAbort { message }.into())
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register abort function: {e}"))
        })?;

    Ok(())
}

/// Charge a host call that will copy up to `len` guest bytes.
///
/// The charge is taken before memory is touched. When the meter cannot pay,
/// the call fails the same way a metered block does, so the invocation ends
/// as `OutOfGas`.
fn charge_host_call(caller: &mut Caller<'_, InvocationContext>, len: i32) -> wasmtime::Result<()> {
    let len = usize::try_from(len).unwrap_or(0);
    caller.data_mut().charge(LoggingHost::cost(len))?;
    Ok(())
}

/// Read a UTF-8 string out of the guest's exported memory.
///
/// The whole region must lie inside memory, but at most
/// [`MAX_LOG_MESSAGE_BYTES`] of it are copied. Returns `None` (after logging
/// why) if the region is invalid. Invalid UTF-8 is replaced lossily.
#[allow(clippy::cast_sign_loss)]
fn read_guest_str(caller: &mut Caller<'_, InvocationContext>, ptr: i32, len: i32) -> Option<String> {
    if ptr < 0 || len < 0 {
        warn!(ptr, len, "Invalid pointer or length (negative value)");
        return None;
    }

    let Some(memory) = caller
        .get_export(MEMORY_EXPORT)
        .and_then(wasmtime::Extern::into_memory)
    else {
        warn!("Memory export not found in guest module");
        return None;
    };

    let data = memory.data(&*caller);
    let start = ptr as usize;
    let Some(end) = start.checked_add(len as usize) else {
        warn!(ptr, len, "Pointer + length overflow");
        return None;
    };

    if end > data.len() {
        warn!(
            start,
            end,
            memory_size = data.len(),
            "Memory access out of bounds"
        );
        return None;
    }

    let copied = end.min(start + MAX_LOG_MESSAGE_BYTES);
    Some(String::from_utf8_lossy(&data[start..copied]).into_owned())
}
