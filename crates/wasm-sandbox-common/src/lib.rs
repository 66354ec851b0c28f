//! Common types, errors, and configuration for wasm-sandbox.
//!
//! This crate provides shared functionality used across the wasm-sandbox workspace:
//! - Error types using `thiserror`, including the invocation failure taxonomy
//! - Configuration structures and TOML loading
//! - Page-size constants shared by the memory limiter and the engine

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    EngineConfig, ExecutionConfig, GasConfig, MAX_WASM_PAGES, RuntimeConfig, WASM_PAGE_SIZE,
};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{FailureKind, InvocationError, MemoryError, RuntimeError};
