//! Host imports and host construction for wasm-sandbox.
//!
//! Guest modules may import the functions registered here; anything else they
//! import fails to link. Domain capabilities (storage, crypto, sub-calls) are
//! registered by the embedder on the same linker via
//! [`WasmEngine::linker_mut`].
//!
//! # Interfaces
//!
//! - [`logging`]: `env.log`, structured logging from guest code
//! - [`linker`]: Registration of every import, including `env.abort`
//!
//! # Gas
//!
//! Each import charges the invocation's meter before it runs: one operation
//! for the call and one per 32 message bytes copied out of guest memory.

pub mod linker;
pub mod logging;

use std::sync::Arc;

use tracing::info;
use wasm_sandbox_common::{EngineConfig, RuntimeConfig, RuntimeError};
use wasm_sandbox_core::{ConcurrencyGate, ExecutionHost, GasSchedule, WasmEngine};

pub use linker::{GuestAbort, register_all};
pub use logging::LoggingHost;

/// Create an engine with every standard host import registered.
///
/// # Errors
///
/// Returns an error if the engine cannot be built or an import cannot be registered.
pub fn create_engine(config: &EngineConfig) -> Result<WasmEngine, RuntimeError> {
    let mut engine = WasmEngine::new(config)?;
    register_all(engine.linker_mut())?;
    Ok(engine)
}

/// Build a ready-to-use execution host from configuration.
///
/// The gas schedule comes from the `gas` table; the gate only keeps books.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the engine cannot be built.
pub fn create_host(config: &RuntimeConfig) -> Result<ExecutionHost<WasmEngine>, RuntimeError> {
    if config.gas.cost_per_operation == 0 {
        return Err(RuntimeError::invalid_config(
            "gas.cost_per_operation must be non-zero",
        ));
    }

    let engine = create_engine(&config.engine)?;
    let gate = Arc::new(ConcurrencyGate::new());
    let schedule = GasSchedule::from(&config.gas);

    info!(
        default_memory_limit_pages = config.execution.memory_limit_pages,
        default_gas_limit = config.execution.gas_limit,
        "Sandbox host ready"
    );

    Ok(ExecutionHost::new(engine, gate, schedule))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_host_from_default_config() {
        let host = create_host(&RuntimeConfig::default()).unwrap();

        assert_eq!(host.schedule(), GasSchedule::default());
        assert_eq!(host.gate().snapshot().reserved_pages, 0);
    }

    #[test]
    fn test_create_host_applies_schedule() {
        let mut config = RuntimeConfig::default();
        config.gas.schedule_version = 2;
        config.gas.cost_per_operation = 10;

        let host = create_host(&config).unwrap();

        assert_eq!(host.schedule(), GasSchedule::new(2, 10));
    }

    #[test]
    fn test_create_host_rejects_zero_cost() {
        let mut config = RuntimeConfig::default();
        config.gas.cost_per_operation = 0;

        assert!(matches!(
            create_host(&config),
            Err(RuntimeError::InvalidConfig { .. })
        ));
    }
}
