//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that also records the linear memory the module asks for. The memory limiter
//! needs that request before instantiation, so it is read once at compile time
//! with `wasmparser` and kept alongside the compiled code.
//!
//! What gets compiled is not the submitted module but its gas-metered rewrite
//! (see [`crate::metering`]). The submitted bytes are validated first so
//! errors describe the guest's own code.
//!
//! A compiled module is immutable and cheap to clone; the same artifact can back
//! any number of concurrent invocations.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmparser::{Parser, Payload, TypeRef};
use wasmtime::{Engine, Module};

use wasm_sandbox_common::InvocationError;

use crate::limiter::MemoryType;
use crate::metering::inject_gas_metering;

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is thread-safe and can be shared across multiple instances.
/// The underlying Wasmtime module is also thread-safe.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Memory declared or imported by the module, before any adjustment.
    requested_memory: Option<MemoryType>,

    /// Hash of the submitted Wasm bytes.
    content_hash: String,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::Validation`] if the bytes are not a valid
    /// module under the engine's feature set.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, InvocationError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        Module::validate(engine, bytes)
            .map_err(|e| InvocationError::validation(e.root_cause().to_string()))?;
        let requested_memory = inspect_memory(bytes)?;

        let metered = inject_gas_metering(bytes)?;
        let module = Module::new(engine, &metered)
            .map_err(|e| InvocationError::validation(e.root_cause().to_string()))?;

        let content_hash = compute_hash(bytes);
        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            duration_ms = duration.as_millis(),
            requested_memory = ?requested_memory,
            "Module compiled"
        );

        Ok(Self {
            inner: module,
            requested_memory,
            content_hash,
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::Validation`] if the text does not parse or
    /// the resulting module is invalid.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, InvocationError> {
        let bytes = wat::parse_str(wat)
            .map_err(|e| InvocationError::validation(format!("WAT parse failed: {e}")))?;
        Self::from_bytes(engine, &bytes)
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// Memory type requested by the module, if it defines or imports a memory.
    pub fn requested_memory(&self) -> Option<MemoryType> {
        self.requested_memory
    }

    /// Get the content hash of the source Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), InvocationError> {
        if bytes.len() < 8 {
            return Err(InvocationError::validation("Invalid Wasm: file too small"));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(InvocationError::validation("Invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("requested_memory", &self.requested_memory)
            .finish_non_exhaustive()
    }
}

/// Find the first memory the module imports or defines.
///
/// Multi-memory is disabled in the engine, so a valid module has at most one.
fn inspect_memory(bytes: &[u8]) -> Result<Option<MemoryType>, InvocationError> {
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(|e| InvocationError::validation(e.to_string()))?;

        match payload {
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| InvocationError::validation(e.to_string()))?;
                    if let TypeRef::Memory(memory) = import.ty {
                        debug!(
                            module = import.module,
                            name = import.name,
                            "Module imports its memory"
                        );
                        return Ok(Some(to_memory_type(memory)));
                    }
                }
            }
            Payload::MemorySection(reader) => {
                if let Some(memory) = reader.into_iter().next() {
                    let memory = memory.map_err(|e| InvocationError::validation(e.to_string()))?;
                    return Ok(Some(to_memory_type(memory)));
                }
            }
            _ => {}
        }
    }

    Ok(None)
}

/// Narrow a parsed memory type to 32-bit page counts.
///
/// memory64 is disabled, so anything past `u32::MAX` pages already failed
/// validation; saturate instead of truncating.
fn to_memory_type(memory: wasmparser::MemoryType) -> MemoryType {
    let pages = |value: u64| u32::try_from(value).unwrap_or(u32::MAX);
    MemoryType::new(pages(memory.initial), memory.maximum.map(pages))
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
