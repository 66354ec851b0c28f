//! Engine abstraction used by the [`ExecutionHost`](crate::ExecutionHost).
//!
//! The host never talks to wasmtime directly. It drives a [`Backend`] that can
//! compile code, report the memory a module asks for, and instantiate it with
//! the per-invocation [`InstanceResources`]. The resulting [`BackendInstance`]
//! runs entry points and grows memory. [`WasmEngine`](crate::WasmEngine) is
//! the production backend. Tests can substitute a scripted one to exercise the
//! limiter, meter and gate without a real WebAssembly runtime.

use wasm_sandbox_common::InvocationError;

use crate::limiter::{MemoryGuard, MemoryType};
use crate::meter::GasMeter;
use crate::store::LogEntry;

/// Per-invocation resources handed to [`Backend::instantiate`].
///
/// A backend must route every allocation and growth of guest memory through
/// `memory`, and charge every executed operation to `meter`.
#[derive(Debug)]
pub struct InstanceResources {
    /// Unique id of the invocation, for tracing only.
    pub invocation_id: String,
    /// The gas budget for this invocation.
    pub meter: GasMeter,
    /// Guard over the validated memory type and the shared page ledger.
    pub memory: MemoryGuard,
}

/// A WebAssembly engine capable of hosting untrusted modules.
pub trait Backend: Send + Sync {
    /// A compiled module, shareable across invocations.
    type Artifact: Send + Sync;

    /// A live instance, owned by exactly one invocation.
    type Instance: BackendInstance;

    /// Compile and validate module bytes.
    ///
    /// Fails with [`InvocationError::Validation`] if the engine rejects them.
    fn compile(&self, code: &[u8]) -> Result<Self::Artifact, InvocationError>;

    /// The memory type the module declares, if it has a memory.
    fn requested_memory(&self, artifact: &Self::Artifact) -> Option<MemoryType>;

    /// Link and instantiate a compiled module.
    ///
    /// Fails with [`InvocationError::Link`] for unresolved imports. A start
    /// function that traps or runs out of gas fails with
    /// [`InvocationError::Trapped`] or [`InvocationError::OutOfGas`].
    fn instantiate(
        &self,
        artifact: &Self::Artifact,
        resources: InstanceResources,
    ) -> Result<Self::Instance, InvocationError>;
}

/// A linked, runnable instance.
pub trait BackendInstance {
    /// Call `entry_point` with `input` and return the guest's output bytes.
    fn run(&mut self, entry_point: &str, input: &[u8]) -> Result<Vec<u8>, InvocationError>;

    /// Grow linear memory by `delta_pages`.
    ///
    /// Returns the previous size in pages, or `None` if the growth was refused
    /// (the same result a guest sees as `-1` from `memory.grow`).
    fn grow_memory(&mut self, delta_pages: u32) -> Option<u32>;

    /// Gas charged so far.
    fn gas_consumed(&self) -> u64;

    /// Drain the logs the guest emitted through host imports.
    fn take_logs(&mut self) -> Vec<LogEntry> {
        Vec::new()
    }
}
