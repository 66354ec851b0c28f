//! Per-invocation store state.
//!
//! This module provides:
//! - [`InvocationContext`]: Per-invocation state accessible from host functions,
//!   including the gas meter every metered block and host import charges
//! - [`SandboxLimiter`]: The wasmtime [`ResourceLimiter`] for one instance
//! - [`LogEntry`] and [`LogLevel`]: Logs emitted by guest code

use tracing::warn;
use wasmtime::{ResourceLimiter, StoreLimits, StoreLimitsBuilder};

use wasm_sandbox_common::{EngineConfig, WASM_PAGE_SIZE};

use crate::limiter::MemoryGuard;
use crate::meter::{GasExhausted, GasMeter};

/// Per-invocation state stored in the wasmtime [`wasmtime::Store`].
///
/// Created when an instance is built and dropped with it at teardown.
/// Host functions reach it through [`wasmtime::Caller::data_mut`].
pub struct InvocationContext {
    /// Unique invocation identifier for tracing.
    pub invocation_id: String,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Gas budget of the invocation.
    pub meter: GasMeter,

    /// Resource limiter for the instance's memories and tables.
    pub limiter: SandboxLimiter,
}

impl InvocationContext {
    /// Create a context for one invocation.
    pub fn new(invocation_id: String, meter: GasMeter, limiter: SandboxLimiter) -> Self {
        Self {
            invocation_id,
            logs: Vec::new(),
            meter,
            limiter,
        }
    }

    /// Charge `operations` before the work they pay for runs.
    pub fn charge(&mut self, operations: u64) -> Result<(), GasExhausted> {
        self.meter.charge_operations(operations)
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry { level, message });
    }
}

/// A single log entry from guest code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Resource limiter for one wasmtime instance.
///
/// The engine's standard limits ([`StoreLimits`]: one instance, one memory,
/// bounded tables) stay in force, and the memory guard is layered on top of
/// them.
pub struct SandboxLimiter {
    memory: MemoryGuard,
    base: StoreLimits,
    max_table_elements: usize,
}

impl SandboxLimiter {
    /// Create a limiter from a memory guard and the engine's table settings.
    pub fn new(memory: MemoryGuard, config: &EngineConfig) -> Self {
        let base = StoreLimitsBuilder::new()
            .instances(1)
            .memories(1)
            .tables(config.max_tables)
            .build();

        Self {
            memory,
            base,
            max_table_elements: config.max_table_elements,
        }
    }

    /// The memory guard.
    pub fn memory(&self) -> &MemoryGuard {
        &self.memory
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if !self.base.memory_growing(current, desired, maximum)? {
            return Ok(false);
        }

        Ok(self
            .memory
            .memory_growing(bytes_to_pages(current), bytes_to_pages(desired))
            .is_ok())
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_table_elements {
            warn!(
                current,
                desired,
                limit = self.max_table_elements,
                "Table growth denied"
            );
            return Ok(false);
        }
        self.base.table_growing(current, desired, maximum)
    }

    fn instances(&self) -> usize {
        self.base.instances()
    }

    fn tables(&self) -> usize {
        self.base.tables()
    }

    fn memories(&self) -> usize {
        self.base.memories()
    }
}

/// Convert a byte size reported by the engine into pages.
fn bytes_to_pages(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(WASM_PAGE_SIZE)
}
