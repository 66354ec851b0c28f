//! The execution host.
//!
//! [`ExecutionHost`] drives one invocation through a fixed sequence:
//!
//! 1. **Prepare**: compile (or reuse) the module
//! 2. **Adjust & Validate**: admit the requested memory under the limit
//! 3. **Instantiate**: link imports, allocate memory, run the start function
//! 4. **Run**: call the entry point with the input bytes
//! 5. **Teardown**: drop the instance and release its pages
//!
//! A failure in any step returns immediately; later steps never run.

use std::sync::Arc;

use tracing::{Span, debug, error, field, info, instrument, warn};
use uuid::Uuid;

use wasm_sandbox_common::{ExecutionConfig, FailureKind, InvocationError};

use crate::backend::{Backend, BackendInstance, InstanceResources};
use crate::gate::ConcurrencyGate;
use crate::limiter::{LimitingTunables, MemoryGuard, MemoryType, limit_to_pages};
use crate::meter::{GasMeter, GasSchedule};
use crate::store::LogEntry;

/// Per-invocation limits chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Memory limit in pages. Values above the global ceiling are clamped.
    pub memory_pages: u32,
    /// Gas budget.
    pub gas: u64,
}

impl Limits {
    /// Create limits.
    pub const fn new(memory_pages: u32, gas: u64) -> Self {
        Self { memory_pages, gas }
    }

    /// Limits with the memory ceiling given in bytes, rounded down to whole pages.
    pub fn from_bytes(memory_limit_bytes: u64, gas: u64) -> Self {
        Self::new(limit_to_pages(memory_limit_bytes), gas)
    }

    /// Default limits from the execution configuration.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.memory_limit_pages, config.gas_limit)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// One invocation: code, entry point, input and limits.
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    /// Module bytes.
    pub code: &'a [u8],
    /// Exported function to call.
    pub entry_point: &'a str,
    /// Bytes handed to the entry point.
    pub input: &'a [u8],
    /// Memory and gas limits.
    pub limits: Limits,
}

impl<'a> InvocationRequest<'a> {
    /// Create a request with empty input and default limits.
    pub fn new(code: &'a [u8], entry_point: &'a str) -> Self {
        Self {
            code,
            entry_point,
            input: &[],
            limits: Limits::default(),
        }
    }

    /// Set the input bytes.
    #[must_use]
    pub fn with_input(mut self, input: &'a [u8]) -> Self {
        self.input = input;
        self
    }

    /// Set the memory limit in pages.
    #[must_use]
    pub fn with_memory_limit(mut self, pages: u32) -> Self {
        self.limits.memory_pages = pages;
        self
    }

    /// Set the gas budget.
    #[must_use]
    pub fn with_gas_limit(mut self, gas: u64) -> Self {
        self.limits.gas = gas;
        self
    }

    /// Replace both limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// A successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Bytes returned by the entry point.
    pub output: Vec<u8>,
    /// Gas charged, never above the limit.
    pub gas_used: u64,
    /// Logs the guest emitted through host imports.
    pub logs: Vec<LogEntry>,
}

/// Runs untrusted modules under memory and gas limits.
///
/// Safe to share across threads when the backend is. Invocations are
/// independent and only meet at the [`ConcurrencyGate`] while updating page
/// bookkeeping.
pub struct ExecutionHost<B: Backend> {
    backend: B,
    gate: Arc<ConcurrencyGate>,
    schedule: GasSchedule,
}

impl<B: Backend> ExecutionHost<B> {
    /// Create a host. The gas schedule is fixed for the host's lifetime.
    pub fn new(backend: B, gate: Arc<ConcurrencyGate>, schedule: GasSchedule) -> Self {
        info!(
            schedule_version = schedule.version(),
            cost_per_operation = schedule.cost(),
            "Execution host created"
        );
        Self {
            backend,
            gate,
            schedule,
        }
    }

    /// The engine backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The shared page gate.
    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// The gas schedule.
    pub fn schedule(&self) -> GasSchedule {
        self.schedule
    }

    /// Compile module bytes once for reuse with [`ExecutionHost::execute_compiled`].
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub fn compile(&self, code: &[u8]) -> Result<B::Artifact, InvocationError> {
        self.backend.compile(code).inspect_err(|e| {
            warn!(error = %e, "Module rejected");
        })
    }

    /// Compile and run a request.
    pub fn execute(&self, request: &InvocationRequest<'_>) -> Result<Completion, InvocationError> {
        let artifact = self.compile(request.code)?;
        self.execute_compiled(&artifact, request.entry_point, request.input, request.limits)
    }

    /// Run a compiled module.
    #[instrument(
        skip(self, artifact, input),
        fields(
            invocation_id = field::Empty,
            input_len = input.len(),
            memory_limit_pages = limits.memory_pages,
            gas_limit = limits.gas,
        )
    )]
    pub fn execute_compiled(
        &self,
        artifact: &B::Artifact,
        entry_point: &str,
        input: &[u8],
        limits: Limits,
    ) -> Result<Completion, InvocationError> {
        let invocation_id = Uuid::new_v4().to_string();
        Span::current().record("invocation_id", invocation_id.as_str());

        let result = self.run_invocation(invocation_id, artifact, entry_point, input, limits);

        match &result {
            Ok(completion) => {
                debug_assert!(completion.gas_used <= limits.gas);
                info!(
                    gas_used = completion.gas_used,
                    output_len = completion.output.len(),
                    logs = completion.logs.len(),
                    "Invocation completed"
                );
            }
            Err(e) => log_failure(e),
        }

        result
    }

    fn run_invocation(
        &self,
        invocation_id: String,
        artifact: &B::Artifact,
        entry_point: &str,
        input: &[u8],
        limits: Limits,
    ) -> Result<Completion, InvocationError> {
        // Adjust & Validate
        let tunables = LimitingTunables::new(limits.memory_pages);
        let requested = self
            .backend
            .requested_memory(artifact)
            .unwrap_or(MemoryType::new(0, None));
        let memory = tunables.admit(requested)?;
        debug!(
            minimum = memory.minimum(),
            maximum = memory.maximum(),
            "Memory admitted"
        );

        // Instantiate
        let resources = InstanceResources {
            invocation_id,
            meter: GasMeter::new(limits.gas, self.schedule),
            memory: MemoryGuard::new(memory, Arc::clone(&self.gate)),
        };
        let mut instance = self.backend.instantiate(artifact, resources)?;
        debug!("Instance ready");

        // Run
        let result = instance.run(entry_point, input);
        let gas_used = instance.gas_consumed();
        let logs = instance.take_logs();

        // Teardown
        drop(instance);
        debug!(gas_used, "Instance torn down");

        let output = result?;
        Ok(Completion {
            output,
            gas_used,
            logs,
        })
    }
}

fn log_failure(e: &InvocationError) {
    match e.kind() {
        FailureKind::OutOfGas => {
            warn!(gas_consumed = e.gas_consumed(), "Invocation ran out of gas");
        }
        FailureKind::Trapped => {
            error!(gas_consumed = e.gas_consumed(), error = %e, "Invocation trapped");
        }
        FailureKind::Memory | FailureKind::Link | FailureKind::Validation => {
            warn!(kind = %e.kind(), error = %e, "Invocation rejected");
        }
    }
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for ExecutionHost<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHost")
            .field("backend", &self.backend)
            .field("schedule", &self.schedule)
            .field("ledger", &self.gate.snapshot())
            .finish()
    }
}
