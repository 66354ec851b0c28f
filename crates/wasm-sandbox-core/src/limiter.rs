//! Linear-memory limiting.
//!
//! Guest-requested memory is never trusted as-is. [`LimitingTunables`] turns a
//! requested [`MemoryType`] into one with a maximum that fits the configured
//! limit ([`LimitingTunables::adjust_memory`]) and checks both bounds
//! independently ([`LimitingTunables::validate_memory`]). Adjusting alone can
//! still produce an invalid type (a minimum above the limit), so only
//! [`LimitingTunables::admit`] hands out the [`ValidatedMemory`] a backend
//! needs to allocate anything.
//!
//! [`MemoryGuard`] is the per-instance half: every allocation and growth of
//! the instance's memory passes through it, and it records granted pages with
//! the shared [`ConcurrencyGate`].

use std::sync::Arc;

use tracing::{debug, warn};

use wasm_sandbox_common::{MAX_WASM_PAGES, MemoryError, WASM_PAGE_SIZE};

use crate::gate::ConcurrencyGate;

/// Limits of a linear memory, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Pages allocated at instantiation.
    pub minimum: u32,
    /// Upper bound on growth, if the module declares one.
    pub maximum: Option<u32>,
}

impl MemoryType {
    /// Create a memory type.
    pub const fn new(minimum: u32, maximum: Option<u32>) -> Self {
        Self { minimum, maximum }
    }
}

/// A memory type that passed [`LimitingTunables::validate_memory`].
///
/// Only [`LimitingTunables::admit`] constructs this, so holding one proves the
/// bounds were checked against the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedMemory {
    minimum: u32,
    maximum: u32,
}

impl ValidatedMemory {
    /// Pages allocated at instantiation.
    pub fn minimum(&self) -> u32 {
        self.minimum
    }

    /// Hard ceiling for this instance, in pages.
    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// Hard ceiling for this instance, in bytes.
    pub fn maximum_bytes(&self) -> u64 {
        u64::from(self.maximum) * WASM_PAGE_SIZE
    }
}

/// Memory limiter configured with a page limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitingTunables {
    limit: u32,
}

impl LimitingTunables {
    /// Create a limiter. A limit above [`MAX_WASM_PAGES`] is clamped down to it.
    pub fn new(limit: u32) -> Self {
        if limit > MAX_WASM_PAGES {
            debug!(
                requested = limit,
                clamped = MAX_WASM_PAGES,
                "Memory limit clamped to the global page ceiling"
            );
        }
        Self {
            limit: limit.min(MAX_WASM_PAGES),
        }
    }

    /// Effective limit in pages.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Set a maximum if the requested type has none.
    ///
    /// The minimum is left untouched, so the result may still be invalid.
    pub fn adjust_memory(&self, requested: MemoryType) -> MemoryType {
        MemoryType {
            minimum: requested.minimum,
            maximum: Some(requested.maximum.unwrap_or(self.limit)),
        }
    }

    /// Check that a memory type fits within the limit.
    pub fn validate_memory(&self, candidate: &MemoryType) -> Result<(), MemoryError> {
        if candidate.minimum > self.limit {
            return Err(MemoryError::MinimumExceedsLimit {
                minimum: candidate.minimum,
                limit: self.limit,
            });
        }

        match candidate.maximum {
            None => Err(MemoryError::MaximumUnset),
            Some(maximum) if maximum > self.limit => Err(MemoryError::MaximumExceedsLimit {
                maximum,
                limit: self.limit,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Adjust then validate a requested memory type.
    pub fn admit(&self, requested: MemoryType) -> Result<ValidatedMemory, MemoryError> {
        let adjusted = self.adjust_memory(requested);
        self.validate_memory(&adjusted)?;

        let maximum = adjusted.maximum.ok_or(MemoryError::MaximumUnset)?;
        // A declared maximum below the minimum is rejected by the engine at
        // compile time; keep the witness consistent regardless.
        Ok(ValidatedMemory {
            minimum: adjusted.minimum,
            maximum: maximum.max(adjusted.minimum),
        })
    }
}

/// Convert a byte limit into whole pages, clamped to [`MAX_WASM_PAGES`].
pub fn limit_to_pages(limit_bytes: u64) -> u32 {
    let pages = limit_bytes / WASM_PAGE_SIZE;
    u32::try_from(pages).map_or(MAX_WASM_PAGES, |pages| pages.min(MAX_WASM_PAGES))
}

/// A growth past the instance's validated maximum was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthDenied {
    /// Requested size, in pages.
    pub desired: u64,
    /// Validated maximum, in pages.
    pub maximum: u32,
}

/// Per-instance memory guard.
///
/// Sits between the engine and the instance's linear memory. The first call
/// is the allocation at instantiation; later calls are guest or host growth.
/// Pages granted here are recorded with the [`ConcurrencyGate`] and released
/// when the guard is dropped. Whether growth succeeds depends only on this
/// instance's validated maximum.
#[derive(Debug)]
pub struct MemoryGuard {
    memory: ValidatedMemory,
    gate: Arc<ConcurrencyGate>,
    reserved_pages: u64,
    allocated: bool,
}

impl MemoryGuard {
    /// Create a guard for one instance.
    pub fn new(memory: ValidatedMemory, gate: Arc<ConcurrencyGate>) -> Self {
        Self {
            memory,
            gate,
            reserved_pages: 0,
            allocated: false,
        }
    }

    /// The validated memory type backing this instance.
    pub fn memory(&self) -> ValidatedMemory {
        self.memory
    }

    /// Pages this instance currently holds in the shared ledger.
    pub fn reserved_pages(&self) -> u64 {
        self.reserved_pages
    }

    /// Decide whether memory may grow from `current_pages` to `desired_pages`.
    ///
    /// # Panics
    ///
    /// Panics if the initial allocation is larger than the validated maximum:
    /// that memory type never went through validation.
    pub fn memory_growing(
        &mut self,
        current_pages: u64,
        desired_pages: u64,
    ) -> Result<(), GrowthDenied> {
        let maximum = self.memory.maximum;

        if !self.allocated {
            assert!(
                desired_pages <= u64::from(maximum),
                "allocating {desired_pages} pages of guest memory from an unvalidated memory type (validated maximum {maximum})"
            );
        } else if desired_pages > u64::from(maximum) {
            warn!(
                current_pages,
                desired_pages,
                maximum,
                "Memory growth denied: exceeds validated maximum"
            );
            self.gate.acquire().record_denial();
            return Err(GrowthDenied {
                desired: desired_pages,
                maximum,
            });
        }

        let delta = desired_pages.saturating_sub(current_pages);
        if delta > 0 {
            self.gate.acquire().reserve(delta);
            self.reserved_pages += delta;
        }

        self.allocated = true;
        debug!(current_pages, desired_pages, "Memory growth granted");
        Ok(())
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        if self.reserved_pages > 0 {
            self.gate.acquire().release(self.reserved_pages);
            self.reserved_pages = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMIT: u32 = 256;

    fn guard(minimum: u32, maximum: Option<u32>, gate: &Arc<ConcurrencyGate>) -> MemoryGuard {
        let memory = LimitingTunables::new(LIMIT)
            .admit(MemoryType::new(minimum, maximum))
            .unwrap();
        MemoryGuard::new(memory, Arc::clone(gate))
    }

    #[test]
    fn test_adjust_sets_missing_maximum() {
        let tunables = LimitingTunables::new(LIMIT);
        let adjusted = tunables.adjust_memory(MemoryType::new(1, None));

        assert_eq!(adjusted, MemoryType::new(1, Some(LIMIT)));
    }

    #[test]
    fn test_adjust_keeps_explicit_maximum_and_minimum() {
        let tunables = LimitingTunables::new(LIMIT);

        let adjusted = tunables.adjust_memory(MemoryType::new(3, Some(10)));
        assert_eq!(adjusted, MemoryType::new(3, Some(10)));

        // Never raises or lowers the minimum, even when it is out of range.
        let adjusted = tunables.adjust_memory(MemoryType::new(LIMIT + 1, None));
        assert_eq!(adjusted.minimum, LIMIT + 1);
    }

    #[test]
    fn test_validate_errors() {
        let tunables = LimitingTunables::new(LIMIT);

        assert_eq!(
            tunables.validate_memory(&MemoryType::new(LIMIT + 1, Some(LIMIT))),
            Err(MemoryError::MinimumExceedsLimit {
                minimum: LIMIT + 1,
                limit: LIMIT
            })
        );
        assert_eq!(
            tunables.validate_memory(&MemoryType::new(1, None)),
            Err(MemoryError::MaximumUnset)
        );
        assert_eq!(
            tunables.validate_memory(&MemoryType::new(1, Some(LIMIT + 1))),
            Err(MemoryError::MaximumExceedsLimit {
                maximum: LIMIT + 1,
                limit: LIMIT
            })
        );
    }

    #[test]
    fn test_boundary_at_limit() {
        let tunables = LimitingTunables::new(LIMIT);

        let exact = tunables.admit(MemoryType::new(LIMIT, Some(LIMIT))).unwrap();
        assert_eq!(exact.minimum(), LIMIT);
        assert_eq!(exact.maximum(), LIMIT);

        let open = tunables.admit(MemoryType::new(LIMIT, None)).unwrap();
        assert_eq!(open.maximum(), LIMIT);

        assert!(matches!(
            tunables.admit(MemoryType::new(LIMIT + 1, None)),
            Err(MemoryError::MinimumExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_limit_clamped_to_global_ceiling() {
        let tunables = LimitingTunables::new(MAX_WASM_PAGES + 1);
        assert_eq!(tunables.limit(), MAX_WASM_PAGES);

        let admitted = tunables.admit(MemoryType::new(1, None)).unwrap();
        assert_eq!(admitted.maximum(), MAX_WASM_PAGES);
        assert_eq!(admitted.maximum_bytes(), 4 * 1024 * 1024 * 1024);

        let full = tunables.admit(MemoryType::new(MAX_WASM_PAGES, None));
        assert!(full.is_ok());
    }

    #[test]
    fn test_limit_to_pages() {
        assert_eq!(limit_to_pages(0), 0);
        assert_eq!(limit_to_pages(WASM_PAGE_SIZE - 1), 0);
        assert_eq!(limit_to_pages(32 * 1024 * 1024), 512);
        assert_eq!(limit_to_pages(u64::MAX), MAX_WASM_PAGES);
        assert_eq!(limit_to_pages(8 * 1024 * 1024 * 1024), MAX_WASM_PAGES);
    }

    #[test]
    fn test_guard_records_and_releases_pages() {
        let gate = Arc::new(ConcurrencyGate::new());

        {
            let mut guard = guard(2, Some(8), &gate);
            guard.memory_growing(0, 2).unwrap();
            guard.memory_growing(2, 5).unwrap();
            assert_eq!(guard.reserved_pages(), 5);
            assert_eq!(gate.snapshot().reserved_pages, 5);
        }

        let ledger = gate.snapshot();
        assert_eq!(ledger.reserved_pages, 0);
        assert_eq!(ledger.granted_pages_total, 5);
        assert_eq!(ledger.released_pages_total, 5);
        assert_eq!(ledger.peak_reserved_pages, 5);
    }

    #[test]
    fn test_guard_denies_growth_past_maximum() {
        let gate = Arc::new(ConcurrencyGate::new());
        let mut guard = guard(1, Some(4), &gate);

        guard.memory_growing(0, 1).unwrap();
        assert_eq!(
            guard.memory_growing(1, 5),
            Err(GrowthDenied {
                desired: 5,
                maximum: 4
            })
        );
        assert_eq!(guard.reserved_pages(), 1);
        assert_eq!(gate.snapshot().denied_growths, 1);
    }

    #[test]
    fn test_guard_ignores_pages_held_elsewhere() {
        let gate = Arc::new(ConcurrencyGate::new());
        gate.acquire().reserve(u64::from(MAX_WASM_PAGES) * 64);

        let mut guard = guard(2, None, &gate);
        guard.memory_growing(0, 2).unwrap();
        guard.memory_growing(2, u64::from(LIMIT)).unwrap();
        assert_eq!(guard.reserved_pages(), u64::from(LIMIT));
        assert_eq!(gate.snapshot().denied_growths, 0);
    }

    #[test]
    fn test_guard_allows_growth_from_zero_minimum() {
        let gate = Arc::new(ConcurrencyGate::new());
        let mut guard = guard(0, Some(2), &gate);

        guard.memory_growing(0, 0).unwrap();
        assert!(guard.memory_growing(0, 3).is_err());
        guard.memory_growing(0, 2).unwrap();
        assert_eq!(gate.snapshot().denied_growths, 1);
    }

    #[test]
    #[should_panic(expected = "unvalidated memory type")]
    fn test_guard_panics_on_oversized_initial_allocation() {
        let gate = Arc::new(ConcurrencyGate::new());
        let mut guard = guard(1, Some(2), &gate);

        let _ = guard.memory_growing(0, 3);
    }

    proptest! {
        #[test]
        fn prop_missing_maximum_becomes_limit(minimum in 0u32..=MAX_WASM_PAGES, limit in 0u32..=MAX_WASM_PAGES) {
            let tunables = LimitingTunables::new(limit);
            let adjusted = tunables.adjust_memory(MemoryType::new(minimum, None));
            prop_assert_eq!(adjusted.maximum, Some(limit));
            prop_assert_eq!(adjusted.minimum, minimum);
        }

        #[test]
        fn prop_minimum_above_limit_rejected(limit in 0u32..MAX_WASM_PAGES, excess in 1u32..1000, maximum in proptest::option::of(0u32..=MAX_WASM_PAGES)) {
            let tunables = LimitingTunables::new(limit);
            let minimum = limit.saturating_add(excess);
            let result = tunables.validate_memory(&MemoryType::new(minimum, maximum));
            let is_minimum_error = matches!(result, Err(MemoryError::MinimumExceedsLimit { .. }));
            prop_assert!(is_minimum_error);
        }

        #[test]
        fn prop_valid_bounds_accepted(limit in 0u32..=MAX_WASM_PAGES, a in 0u32..=MAX_WASM_PAGES, b in 0u32..=MAX_WASM_PAGES) {
            let maximum = a.max(b).min(limit);
            let minimum = a.min(b).min(maximum);
            let tunables = LimitingTunables::new(limit);
            prop_assert!(tunables.validate_memory(&MemoryType::new(minimum, Some(maximum))).is_ok());
        }
    }
}
