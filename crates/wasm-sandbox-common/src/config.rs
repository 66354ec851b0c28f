//! Configuration structures for the sandbox.
//!
//! This module defines configuration options for the sandbox components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (allocation, stack, tables)
//! - [`ExecutionConfig`]: Default per-invocation limits (memory pages, gas)
//! - [`GasConfig`]: The protocol-level gas schedule

use serde::{Deserialize, Serialize};

/// Size of one WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Maximum number of pages a 32-bit linear memory can address (4 GiB).
pub const MAX_WASM_PAGES: u32 = 65_536;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the sandbox.
/// It can be loaded from TOML (see [`crate::config_file::ConfigFile`]) or JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default per-invocation limits.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Gas schedule shared by every invocation of a host.
    #[serde(default)]
    pub gas: GasConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the shared engine and the bookkeeping that is shared
/// across concurrent invocations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator.
    ///
    /// Memory is reserved up front for a pool of instances. Each slot must be
    /// able to hold `instance_memory_pages`, so this is only practical with a
    /// modest per-instance ceiling.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Linear memory per pool slot, in pages.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_pages")]
    pub instance_memory_pages: u32,

    /// Maximum native stack available to guest code, in bytes.
    #[serde(default = "defaults::max_wasm_stack")]
    pub max_wasm_stack: usize,

    /// Maximum number of tables per instance.
    #[serde(default = "defaults::max_tables")]
    pub max_tables: usize,

    /// Maximum number of elements in a single table.
    #[serde(default = "defaults::max_table_elements")]
    pub max_table_elements: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_pages: defaults::instance_memory_pages(),
            max_wasm_stack: defaults::max_wasm_stack(),
            max_tables: defaults::max_tables(),
            max_table_elements: defaults::max_table_elements(),
        }
    }
}

/// Default limits applied to an invocation when the caller does not override them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum linear memory in pages.
    ///
    /// Values above [`MAX_WASM_PAGES`] are clamped by the memory limiter.
    #[serde(default = "defaults::memory_limit_pages")]
    pub memory_limit_pages: u32,

    /// Gas budget per invocation.
    #[serde(default = "defaults::gas_limit")]
    pub gas_limit: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            memory_limit_pages: defaults::memory_limit_pages(),
            gas_limit: defaults::gas_limit(),
        }
    }
}

impl ExecutionConfig {
    /// Memory ceiling in bytes.
    pub fn memory_limit_bytes(&self) -> u64 {
        u64::from(self.memory_limit_pages) * WASM_PAGE_SIZE
    }
}

/// Gas schedule configuration.
///
/// The cost per operation is consensus-critical: every node must run the same
/// schedule version. A host reads it once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GasConfig {
    /// Version tag of the schedule.
    #[serde(default = "defaults::schedule_version")]
    pub schedule_version: u32,

    /// Flat cost charged for every metered operation.
    #[serde(default = "defaults::cost_per_operation")]
    pub cost_per_operation: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            schedule_version: defaults::schedule_version(),
            cost_per_operation: defaults::cost_per_operation(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_pages() -> u32 {
        512
    }

    pub const fn max_wasm_stack() -> usize {
        512 * 1024
    }

    pub const fn max_tables() -> usize {
        1
    }

    pub const fn max_table_elements() -> usize {
        10_000
    }

    pub const fn memory_limit_pages() -> u32 {
        512
    }

    pub const fn gas_limit() -> u64 {
        150_000_000_000
    }

    pub const fn schedule_version() -> u32 {
        1
    }

    pub const fn cost_per_operation() -> u64 {
        150_000
    }
}
