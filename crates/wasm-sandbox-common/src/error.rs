//! Error types for the sandbox.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Engine construction and configuration failures
//! - [`MemoryError`]: Memory admission failures raised by the memory limiter
//! - [`InvocationError`]: The per-invocation failure outcomes reported to callers

use std::io;

use thiserror::Error;

/// Engine construction and configuration errors.
///
/// These are node-level problems (a bad configuration, an unreadable file).
/// They never describe the outcome of a guest invocation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Memory admission failures.
///
/// All of these are detected before any guest code runs and can be resolved by
/// the caller choosing different limits.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The requested minimum is larger than the allowed limit.
    #[error("Minimum of {minimum} pages exceeds the allowed memory limit of {limit} pages")]
    MinimumExceedsLimit {
        /// Requested minimum, in pages.
        minimum: u32,
        /// Configured limit, in pages.
        limit: u32,
    },

    /// No maximum was set on a memory type that is about to back memory.
    #[error("Maximum unset")]
    MaximumUnset,

    /// The maximum is larger than the allowed limit.
    #[error("Maximum of {maximum} pages exceeds the allowed memory limit of {limit} pages")]
    MaximumExceedsLimit {
        /// Requested maximum, in pages.
        maximum: u32,
        /// Configured limit, in pages.
        limit: u32,
    },
}

impl MemoryError {
    /// Short, stable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MinimumExceedsLimit { .. } => "minimum_exceeds_limit",
            Self::MaximumUnset => "maximum_unset",
            Self::MaximumExceedsLimit { .. } => "maximum_exceeds_limit",
        }
    }
}

/// Discriminant of an [`InvocationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Memory admission failed.
    Memory,
    /// Imports or required exports could not be linked.
    Link,
    /// The engine rejected the module.
    Validation,
    /// The guest trapped.
    Trapped,
    /// The gas budget ran out.
    OutOfGas,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Memory => write!(f, "MemoryError"),
            FailureKind::Link => write!(f, "LinkError"),
            FailureKind::Validation => write!(f, "ValidationError"),
            FailureKind::Trapped => write!(f, "Trapped"),
            FailureKind::OutOfGas => write!(f, "OutOfGas"),
        }
    }
}

/// Failure outcome of a single invocation.
///
/// Every variant is a deterministic, per-invocation result: two nodes running
/// the same call must produce the same variant with the same gas figure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// Memory admission failed before any guest code ran.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A host import or a required export could not be linked.
    #[error("Link error: {detail}")]
    Link {
        /// Description of the missing or mismatched item.
        detail: String,
    },

    /// The engine rejected the module bytes.
    #[error("Validation error: {detail}")]
    Validation {
        /// Description of the validation failure.
        detail: String,
    },

    /// The guest raised an unrecoverable fault.
    #[error("Guest trapped: {reason} (gas consumed: {gas_consumed})")]
    Trapped {
        /// Description of the trap.
        reason: String,
        /// Gas charged up to the trap.
        gas_consumed: u64,
    },

    /// The gas budget was exhausted; `gas_consumed` equals the limit.
    #[error("Out of gas (gas consumed: {gas_consumed})")]
    OutOfGas {
        /// Gas charged, always the full limit.
        gas_consumed: u64,
    },
}

impl InvocationError {
    /// Create a new `Link` error.
    pub fn link(detail: impl Into<String>) -> Self {
        Self::Link {
            detail: detail.into(),
        }
    }

    /// Create a new `Validation` error.
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
        }
    }

    /// Create a new `Trapped` error.
    pub fn trapped(reason: impl Into<String>, gas_consumed: u64) -> Self {
        Self::Trapped {
            reason: reason.into(),
            gas_consumed,
        }
    }

    /// The kind of failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Memory(_) => FailureKind::Memory,
            Self::Link { .. } => FailureKind::Link,
            Self::Validation { .. } => FailureKind::Validation,
            Self::Trapped { .. } => FailureKind::Trapped,
            Self::OutOfGas { .. } => FailureKind::OutOfGas,
        }
    }

    /// Gas charged for the failed invocation.
    ///
    /// Admission and linking failures happen before guest code runs and cost nothing.
    pub fn gas_consumed(&self) -> u64 {
        match self {
            Self::Trapped { gas_consumed, .. } | Self::OutOfGas { gas_consumed } => *gas_consumed,
            Self::Memory(_) | Self::Link { .. } | Self::Validation { .. } => 0,
        }
    }

    /// Returns `true` if retrying with a larger budget may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfGas { .. })
    }

    /// Returns `true` if the guest ran and the failure carries a gas charge.
    pub fn is_charged(&self) -> bool {
        matches!(self, Self::Trapped { .. } | Self::OutOfGas { .. })
    }
}
