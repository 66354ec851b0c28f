//! WebAssembly instance lifecycle management.
//!
//! This module provides [`WasmInstance`], one linked wasmtime instance owned by
//! a single invocation. Running an entry point follows the guest ABI:
//!
//! 1. If the input is non-empty, call the guest's `allocate(len) -> ptr` and
//!    copy the input into the returned buffer
//! 2. Call the entry point with `(ptr, len)` (`(0, 0)` for empty input)
//! 3. Copy the `(out_ptr, out_len)` region out of guest memory
//!
//! Guest code charges the [`GasMeter`] in the store as it runs, so the meter is
//! current whenever a guest call returns.

use tracing::debug;
use wasmtime::{Instance, Memory, Store, TypedFunc};

use wasm_sandbox_common::InvocationError;

use crate::backend::BackendInstance;
use crate::meter::{GasExhausted, GasMeter};
use crate::store::{InvocationContext, LogEntry};

/// Name of the exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Name of the exported input allocator.
pub const ALLOCATE_EXPORT: &str = "allocate";

/// A linked instance together with its store, which holds the gas meter.
pub struct WasmInstance {
    store: Store<InvocationContext>,
    instance: Instance,
}

impl WasmInstance {
    pub(crate) fn new(store: Store<InvocationContext>, instance: Instance) -> Self {
        Self { store, instance }
    }

    /// The invocation's gas meter.
    pub fn meter(&self) -> &GasMeter {
        &self.store.data().meter
    }

    /// Run a guest call and classify any failure.
    fn call<R>(
        &mut self,
        f: impl FnOnce(&mut Store<InvocationContext>) -> wasmtime::Result<R>,
    ) -> Result<R, InvocationError> {
        f(&mut self.store).map_err(|error| classify_fault(&error, &mut self.store.data_mut().meter))
    }

    fn memory(&mut self) -> Option<Memory> {
        self.instance.get_memory(&mut self.store, MEMORY_EXPORT)
    }

    fn typed_export<P, R>(&mut self, name: &str) -> Result<TypedFunc<P, R>, InvocationError>
    where
        P: wasmtime::WasmParams,
        R: wasmtime::WasmResults,
    {
        self.instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| InvocationError::link(format!("export `{name}`: {e}")))
    }

    fn trapped(&self, reason: impl Into<String>) -> InvocationError {
        InvocationError::trapped(reason, self.meter().consumed())
    }

    /// Copy `input` into a guest buffer obtained from `allocate`.
    fn write_input(&mut self, input: &[u8]) -> Result<(i32, i32), InvocationError> {
        if input.is_empty() {
            return Ok((0, 0));
        }

        let memory = self
            .memory()
            .ok_or_else(|| InvocationError::link(format!("module does not export `{MEMORY_EXPORT}`")))?;
        let allocate = self.typed_export::<i32, i32>(ALLOCATE_EXPORT)?;

        let len = i32::try_from(input.len())
            .map_err(|_| self.trapped("input does not fit the guest address space"))?;
        let ptr = self.call(|store| allocate.call(store, len))?;

        memory
            .write(&mut self.store, guest_offset(ptr), input)
            .map_err(|_| self.trapped("input buffer out of bounds"))?;

        debug!(ptr, len, "Input written to guest memory");
        Ok((ptr, len))
    }

    /// Copy the output region out of guest memory.
    fn read_output(&mut self, out_ptr: i32, out_len: i32) -> Result<Vec<u8>, InvocationError> {
        if out_len == 0 {
            return Ok(Vec::new());
        }

        let memory = self
            .memory()
            .ok_or_else(|| InvocationError::link(format!("module does not export `{MEMORY_EXPORT}`")))?;

        let start = guest_offset(out_ptr);
        let data = memory.data(&self.store);
        let region = start
            .checked_add(guest_offset(out_len))
            .and_then(|end| data.get(start..end))
            .map(<[u8]>::to_vec);

        region.ok_or_else(|| self.trapped("output region out of bounds"))
    }
}

impl BackendInstance for WasmInstance {
    fn run(&mut self, entry_point: &str, input: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let entry = self.typed_export::<(i32, i32), (i32, i32)>(entry_point)?;
        let (ptr, len) = self.write_input(input)?;

        debug!(entry_point, "Executing entry point");
        let (out_ptr, out_len) = self.call(|store| entry.call(store, (ptr, len)))?;

        self.read_output(out_ptr, out_len)
    }

    fn grow_memory(&mut self, delta_pages: u32) -> Option<u32> {
        let memory = self.memory()?;
        match memory.grow(&mut self.store, u64::from(delta_pages)) {
            Ok(previous) => u32::try_from(previous).ok(),
            Err(e) => {
                debug!(delta_pages, error = %e, "Host-initiated growth refused");
                None
            }
        }
    }

    fn gas_consumed(&self) -> u64 {
        self.meter().consumed()
    }

    fn take_logs(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.store.data_mut().logs)
    }
}

impl std::fmt::Debug for WasmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmInstance")
            .field("invocation_id", &self.store.data().invocation_id)
            .field("meter", self.meter())
            .finish_non_exhaustive()
    }
}

/// Turn an engine error raised while guest code ran into an invocation outcome.
///
/// A refused charge, from a metered block or a host import, exhausts the
/// meter, so `OutOfGas` always reports the full limit. Anything else is a trap
/// charged with the gas consumed so far.
pub(crate) fn classify_fault(error: &wasmtime::Error, meter: &mut GasMeter) -> InvocationError {
    if is_gas_exhausted(error) {
        meter.exhaust();
        debug!(gas_consumed = meter.consumed(), "Execution terminated: gas exhausted");
        return InvocationError::OutOfGas {
            gas_consumed: meter.consumed(),
        };
    }

    let reason = trap_reason(error);
    debug!(gas_consumed = meter.consumed(), trap_message = %reason, "Execution trapped");
    InvocationError::trapped(reason, meter.consumed())
}

/// Root-cause message of a trap.
///
/// Backtraces are disabled, so this is the trap code description or the
/// host import's error, with nothing host-specific attached.
fn trap_reason(error: &wasmtime::Error) -> String {
    error.root_cause().to_string()
}

fn is_gas_exhausted(error: &wasmtime::Error) -> bool {
    error.chain().any(|cause| cause.is::<GasExhausted>())
}

/// Reinterpret a guest `i32` address or length as an unsigned offset.
#[allow(clippy::cast_sign_loss)]
fn guest_offset(value: i32) -> usize {
    value as u32 as usize
}
