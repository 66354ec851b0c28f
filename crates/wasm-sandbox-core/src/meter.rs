//! Deterministic gas metering.
//!
//! Every metered operation costs the same flat fee taken from the
//! [`GasSchedule`]. A [`GasMeter`] accumulates charges against the caller's
//! limit with check-then-charge semantics: a charge that does not fit is never
//! applied partially. The meter is exhausted instead (`consumed == limit`) and
//! the operation it would have paid for does not run.
//!
//! The wasmtime backend charges a meter held in the store: every metered block
//! of a compiled module pays for all of its operators through the
//! `metering.gas` import before the first of them runs.

use thiserror::Error;

use wasm_sandbox_common::GasConfig;

/// Flat-fee gas schedule.
///
/// Changing `cost_per_operation` changes consensus-visible gas figures, so a
/// schedule carries a version and is fixed for the lifetime of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasSchedule {
    version: u32,
    cost_per_operation: u64,
}

impl GasSchedule {
    /// Cost per operation of the version 1 schedule.
    pub const DEFAULT_COST: u64 = 150_000;

    /// Create a schedule. A zero cost is raised to 1 so every operation is charged.
    pub const fn new(version: u32, cost_per_operation: u64) -> Self {
        Self {
            version,
            cost_per_operation: if cost_per_operation == 0 {
                1
            } else {
                cost_per_operation
            },
        }
    }

    /// Schedule version.
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Cost of one metered operation.
    pub const fn cost(&self) -> u64 {
        self.cost_per_operation
    }

    /// Cost of `operations` metered operations, saturating at `u64::MAX`.
    pub const fn cost_of(&self, operations: u64) -> u64 {
        operations.saturating_mul(self.cost_per_operation)
    }

    /// Whole operations that `gas` can pay for.
    pub const fn operations_for(&self, gas: u64) -> u64 {
        gas / self.cost_per_operation
    }
}

impl Default for GasSchedule {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_COST)
    }
}

impl From<&GasConfig> for GasSchedule {
    fn from(config: &GasConfig) -> Self {
        Self::new(config.schedule_version, config.cost_per_operation)
    }
}

/// The budget could not pay for a charge.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("gas exhausted: {consumed} of {limit} consumed")]
pub struct GasExhausted {
    /// Gas consumed after exhaustion, equal to the limit.
    pub consumed: u64,
    /// The budget.
    pub limit: u64,
}

/// Per-invocation gas budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasMeter {
    limit: u64,
    consumed: u64,
    schedule: GasSchedule,
}

impl GasMeter {
    /// Create a meter with nothing consumed.
    pub fn new(limit: u64, schedule: GasSchedule) -> Self {
        Self {
            limit,
            consumed: 0,
            schedule,
        }
    }

    /// The budget.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Gas consumed so far. Never exceeds [`GasMeter::limit`].
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Gas left in the budget.
    pub fn remaining(&self) -> u64 {
        self.limit - self.consumed
    }

    /// Operations the remaining budget can still pay for.
    pub fn remaining_operations(&self) -> u64 {
        self.schedule.operations_for(self.remaining())
    }

    /// The schedule this meter charges with.
    pub fn schedule(&self) -> GasSchedule {
        self.schedule
    }

    /// Returns `true` once the meter has been exhausted or fully spent.
    pub fn is_exhausted(&self) -> bool {
        self.consumed == self.limit
    }

    /// Charge for `operations` metered operations.
    ///
    /// The check happens before the charge: if the full cost does not fit,
    /// the meter is exhausted and nothing for these operations may run.
    pub fn charge_operations(&mut self, operations: u64) -> Result<(), GasExhausted> {
        self.charge_gas(self.schedule.cost_of(operations))
    }

    /// Charge a raw gas amount with the same semantics as [`GasMeter::charge_operations`].
    pub fn charge_gas(&mut self, gas: u64) -> Result<(), GasExhausted> {
        if gas > self.remaining() {
            self.exhaust();
            return Err(GasExhausted {
                consumed: self.consumed,
                limit: self.limit,
            });
        }
        self.consumed += gas;
        Ok(())
    }

    /// Consume the whole budget.
    pub fn exhaust(&mut self) {
        self.consumed = self.limit;
    }
}
