//! A scripted backend for driving the execution host without Wasmtime.
//!
//! Each registered "module" is a list of operations. Every operation costs one
//! metered operation, charged before it takes effect, and every operation that
//! actually runs bumps a counter shared by all instances of the backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use wasm_sandbox_common::InvocationError;
use wasm_sandbox_core::{
    Backend, BackendInstance, GasMeter, InstanceResources, MemoryGuard, MemoryType,
};

/// One scripted guest step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Run `n` operations with no other effect.
    Work(u64),
    /// Grow memory by the given pages and append 1 (granted) or 0 (refused).
    Grow(u32),
    /// Trap with the given reason.
    Trap(&'static str),
    /// Append the input to the output.
    Echo,
    /// Append fixed bytes to the output.
    Emit(&'static [u8]),
}

/// A scripted module.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub memory: Option<MemoryType>,
    pub ops: Vec<Op>,
    pub missing_import: Option<&'static str>,
}

impl Script {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops,
            ..Default::default()
        }
    }

    pub fn with_memory(mut self, minimum: u32, maximum: Option<u32>) -> Self {
        self.memory = Some(MemoryType::new(minimum, maximum));
        self
    }

    pub fn with_missing_import(mut self, name: &'static str) -> Self {
        self.missing_import = Some(name);
        self
    }
}

/// Backend whose modules are [`Script`]s keyed by their code bytes.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: HashMap<Vec<u8>, Arc<Script>>,
    executed: Arc<AtomicU64>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: impl Into<Vec<u8>>, script: Script) {
        self.scripts.insert(code.into(), Arc::new(script));
    }

    /// Operations run so far across every instance.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }
}

impl Backend for ScriptedBackend {
    type Artifact = Arc<Script>;
    type Instance = ScriptedInstance;

    fn compile(&self, code: &[u8]) -> Result<Arc<Script>, InvocationError> {
        self.scripts
            .get(code)
            .cloned()
            .ok_or_else(|| InvocationError::validation("unknown module"))
    }

    fn requested_memory(&self, artifact: &Arc<Script>) -> Option<MemoryType> {
        artifact.memory
    }

    fn instantiate(
        &self,
        artifact: &Arc<Script>,
        resources: InstanceResources,
    ) -> Result<ScriptedInstance, InvocationError> {
        if let Some(name) = artifact.missing_import {
            return Err(InvocationError::link(format!(
                "unknown import: `env::{name}` has not been defined"
            )));
        }

        let InstanceResources {
            meter, mut memory, ..
        } = resources;

        let pages = memory.memory().minimum();
        memory
            .memory_growing(0, u64::from(pages))
            .map_err(|denied| InvocationError::trapped(format!("{denied:?}"), 0))?;

        Ok(ScriptedInstance {
            script: Arc::clone(artifact),
            meter,
            memory,
            pages,
            executed: Arc::clone(&self.executed),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedInstance {
    script: Arc<Script>,
    meter: GasMeter,
    memory: MemoryGuard,
    pages: u32,
    executed: Arc<AtomicU64>,
}

impl ScriptedInstance {
    fn step(&mut self) -> Result<(), InvocationError> {
        self.meter
            .charge_operations(1)
            .map_err(|exhausted| InvocationError::OutOfGas {
                gas_consumed: exhausted.consumed,
            })?;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl BackendInstance for ScriptedInstance {
    fn run(&mut self, _entry_point: &str, input: &[u8]) -> Result<Vec<u8>, InvocationError> {
        let script = Arc::clone(&self.script);
        let mut output = Vec::new();

        for op in &script.ops {
            match op {
                Op::Work(n) => {
                    for _ in 0..*n {
                        self.step()?;
                    }
                }
                Op::Grow(delta) => {
                    self.step()?;
                    output.push(u8::from(self.grow_memory(*delta).is_some()));
                }
                Op::Trap(reason) => {
                    self.step()?;
                    return Err(InvocationError::trapped(*reason, self.meter.consumed()));
                }
                Op::Echo => {
                    self.step()?;
                    output.extend_from_slice(input);
                }
                Op::Emit(bytes) => {
                    self.step()?;
                    output.extend_from_slice(bytes);
                }
            }
        }

        Ok(output)
    }

    fn grow_memory(&mut self, delta_pages: u32) -> Option<u32> {
        let desired = self.pages.checked_add(delta_pages)?;
        self.memory
            .memory_growing(u64::from(self.pages), u64::from(desired))
            .ok()?;
        Some(std::mem::replace(&mut self.pages, desired))
    }

    fn gas_consumed(&self) -> u64 {
        self.meter.consumed()
    }
}
