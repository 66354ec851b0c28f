//! Deterministic, gas-metered WebAssembly execution.
//!
//! This crate provides the sandbox itself:
//! - [`ExecutionHost`]: Runs one invocation from module bytes to output
//! - [`LimitingTunables`] and [`MemoryGuard`]: Memory admission and growth limits
//! - [`GasMeter`] and [`GasSchedule`]: Flat-fee gas accounting
//! - [`inject_gas_metering`]: Per-block gas charges compiled into every module
//! - [`ConcurrencyGate`]: Shared page bookkeeping behind an exclusive token
//! - [`WasmEngine`]: The Wasmtime [`Backend`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ExecutionHost                        │
//! │  (Shared across all invocations, thread-safe)           │
//! │  - Gas schedule (fixed)                                 │
//! │  - Arc<ConcurrencyGate>                                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              LimitingTunables::admit                    │
//! │  (Per invocation, before any guest code)                │
//! │  - Fill in a missing maximum                            │
//! │  - Reject bounds above the limit                        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Backend::instantiate + BackendInstance::run    │
//! │  (Per invocation, isolated)                             │
//! │  - GasMeter (charged by metered blocks)                 │
//! │  - MemoryGuard (limits growth, reserves pages)          │
//! │  - Guest logs                                           │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod engine;
pub mod executor;
pub mod gate;
pub mod instance;
pub mod limiter;
pub mod meter;
pub mod metering;
pub mod module;
pub mod store;

pub use backend::{Backend, BackendInstance, InstanceResources};
pub use engine::WasmEngine;
pub use executor::{Completion, ExecutionHost, InvocationRequest, Limits};
pub use gate::{ConcurrencyGate, GateToken, MemoryLedger};
pub use instance::{ALLOCATE_EXPORT, MEMORY_EXPORT, WasmInstance};
pub use limiter::{
    GrowthDenied, LimitingTunables, MemoryGuard, MemoryType, ValidatedMemory, limit_to_pages,
};
pub use meter::{GasExhausted, GasMeter, GasSchedule};
pub use metering::{GAS_FUNCTION, GAS_MODULE, inject_gas_metering};
pub use module::CompiledModule;
pub use store::{InvocationContext, LogEntry, LogLevel, SandboxLimiter};
