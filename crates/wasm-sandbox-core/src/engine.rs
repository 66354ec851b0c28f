//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the production [`Backend`]. It is:
//! - Thread-safe and shared across all invocations
//! - Configured so that every node executes a module identically
//! - Metered by the `metering.gas` import that compiled modules call at the
//!   head of every block
//!
//! Host imports are registered once on the engine's [`Linker`] and shared by
//! every instance.

use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{
    Caller, Config, Engine, InstanceAllocationStrategy, Linker, PoolingAllocationConfig, Store,
};

use wasm_sandbox_common::{EngineConfig, InvocationError, RuntimeError, WASM_PAGE_SIZE};

use crate::backend::{Backend, InstanceResources};
use crate::instance::{WasmInstance, classify_fault};
use crate::limiter::MemoryType;
use crate::metering::{GAS_FUNCTION, GAS_MODULE};
use crate::module::CompiledModule;
use crate::store::{InvocationContext, SandboxLimiter};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Gas Import**: `metering.gas` charges the invocation's meter for each
///   metered block
/// - **Deterministic feature set**: threads, SIMD, multi-memory and memory64
///   are disabled, NaNs are canonicalized
/// - **No backtraces**: trap reasons carry no host-dependent detail
/// - **Pooling Allocator** (optional): Pre-allocates instance slots
///
/// There is no epoch interruption; gas is the only bound on execution time.
///
/// # Example
///
/// ```ignore
/// use wasm_sandbox_common::EngineConfig;
/// use wasm_sandbox_core::WasmEngine;
///
/// let config = EngineConfig::default();
/// let engine = WasmEngine::new(&config)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    linker: Linker<InvocationContext>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The engine configuration is inconsistent
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The gas import cannot be registered
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        Self::check_config(config)?;

        let mut wasmtime_config = Config::new();

        // Features whose results can differ between hosts
        wasmtime_config.wasm_threads(false);
        wasmtime_config.wasm_relaxed_simd(false);
        wasmtime_config.wasm_simd(false);
        wasmtime_config.wasm_multi_memory(false);
        wasmtime_config.wasm_memory64(false);
        wasmtime_config.cranelift_nan_canonicalization(true);

        wasmtime_config.wasm_backtrace(false);
        wasmtime_config.max_wasm_stack(config.max_wasm_stack);
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_pages = config.instance_memory_pages,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;
        let mut linker = Linker::new(&engine);
        Self::register_gas(&mut linker)?;

        info!(
            max_wasm_stack = config.max_wasm_stack,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            linker,
            config: config.clone(),
        })
    }

    fn check_config(config: &EngineConfig) -> Result<(), RuntimeError> {
        if config.max_wasm_stack == 0 {
            return Err(RuntimeError::invalid_config("max_wasm_stack must be non-zero"));
        }
        if config.pooling_allocator && config.max_instances == 0 {
            return Err(RuntimeError::invalid_config(
                "max_instances must be non-zero when the pooling allocator is enabled",
            ));
        }
        Ok(())
    }

    /// Register the import every metered block calls before it runs.
    ///
    /// A negative operation count cannot be paid for and exhausts the meter.
    fn register_gas(linker: &mut Linker<InvocationContext>) -> Result<(), RuntimeError> {
        linker
            .func_wrap(
                GAS_MODULE,
                GAS_FUNCTION,
                |mut caller: Caller<'_, InvocationContext>, operations: i64| -> wasmtime::Result<()> {
                    let operations = u64::try_from(operations).unwrap_or(u64::MAX);
                    caller.data_mut().charge(operations)?;
                    Ok(())
                },
            )
            .map_err(|e| {
                RuntimeError::invalid_config(format!("Failed to register gas import: {e}"))
            })?;
        Ok(())
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        // One memory and up to `max_tables` tables per instance
        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(
            config
                .max_instances
                .saturating_mul(u32::try_from(config.max_tables).unwrap_or(u32::MAX)),
        );
        pooling.table_elements(config.max_table_elements);

        // Maximum size of a single memory slot in bytes
        let max_memory_bytes = u64::from(config.instance_memory_pages) * WASM_PAGE_SIZE;
        pooling.max_memory_size(usize::try_from(max_memory_bytes).unwrap_or(usize::MAX));

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host imports. Every instance created afterwards
    /// links against them.
    pub fn linker_mut(&mut self) -> &mut Linker<InvocationContext> {
        &mut self.linker
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl Backend for WasmEngine {
    type Artifact = CompiledModule;
    type Instance = WasmInstance;

    fn compile(&self, code: &[u8]) -> Result<CompiledModule, InvocationError> {
        CompiledModule::from_bytes(&self.engine, code)
    }

    fn requested_memory(&self, artifact: &CompiledModule) -> Option<MemoryType> {
        artifact.requested_memory()
    }

    fn instantiate(
        &self,
        artifact: &CompiledModule,
        resources: InstanceResources,
    ) -> Result<WasmInstance, InvocationError> {
        let InstanceResources {
            invocation_id,
            meter,
            memory,
        } = resources;

        let pre = self
            .linker
            .instantiate_pre(artifact.as_module())
            .map_err(|e| InvocationError::link(e.to_string()))?;

        let limiter = SandboxLimiter::new(memory, &self.config);
        let gas_limit = meter.limit();
        let mut store = Store::new(
            &self.engine,
            InvocationContext::new(invocation_id, meter, limiter),
        );
        store.limiter(|ctx| &mut ctx.limiter);

        debug!(gas_limit, "Instantiating module");

        match pre.instantiate(&mut store) {
            Ok(instance) => Ok(WasmInstance::new(store, instance)),
            // The start function may have run; its blocks are already charged.
            Err(error) => Err(classify_fault(&error, &mut store.data_mut().meter)),
        }
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("instance_memory_pages", &self.config.instance_memory_pages)
            .finish_non_exhaustive()
    }
}
