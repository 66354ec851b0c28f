//! Shared memory bookkeeping behind an exclusive gate.
//!
//! Instances never share linear memory, but the host keeps one process-wide
//! [`MemoryLedger`] of pages granted to live instances. Any change to it goes
//! through a [`GateToken`] obtained from [`ConcurrencyGate::acquire`]; the
//! token is the lock guard, so it is released on every exit path when it
//! goes out of scope.
//!
//! The ledger only records. It never refuses a reservation, so what other
//! invocations hold at a given moment cannot change what a guest observes.
//! Invocations contend here only while updating the counters. Guest code
//! never runs while a token is held.

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

/// Process-wide memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryLedger {
    /// Pages currently held by live instances.
    pub reserved_pages: u64,
    /// Highest value `reserved_pages` has reached.
    pub peak_reserved_pages: u64,
    /// Pages granted since the gate was created.
    pub granted_pages_total: u64,
    /// Pages released since the gate was created.
    pub released_pages_total: u64,
    /// Number of granted allocations and growths.
    pub growth_events: u64,
    /// Number of growths refused by an instance's memory guard.
    pub denied_growths: u64,
}

/// Exclusive access to the [`MemoryLedger`].
///
/// Created once per host and shared with every instance through an `Arc`.
#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    ledger: Mutex<MemoryLedger>,
}

impl ConcurrencyGate {
    /// Create a gate with an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the ledger can be mutated exclusively.
    pub fn acquire(&self) -> GateToken<'_> {
        GateToken {
            ledger: self.ledger.lock(),
        }
    }

    /// Copy of the current ledger.
    pub fn snapshot(&self) -> MemoryLedger {
        *self.acquire().ledger()
    }
}

/// Proof of exclusive access to the ledger. Dropping it releases the gate.
pub struct GateToken<'a> {
    ledger: MutexGuard<'a, MemoryLedger>,
}

impl GateToken<'_> {
    /// Read the ledger.
    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// Record `pages` as granted.
    pub fn reserve(&mut self, pages: u64) {
        let ledger = &mut *self.ledger;
        ledger.reserved_pages += pages;
        ledger.granted_pages_total += pages;
        ledger.growth_events += 1;
        ledger.peak_reserved_pages = ledger.peak_reserved_pages.max(ledger.reserved_pages);

        debug!(
            pages,
            reserved_pages = ledger.reserved_pages,
            "Pages reserved"
        );
    }

    /// Record a growth an instance's guard refused.
    pub fn record_denial(&mut self) {
        self.ledger.denied_growths += 1;
    }

    /// Return `pages` previously granted with [`GateToken::reserve`].
    pub fn release(&mut self, pages: u64) {
        let ledger = &mut *self.ledger;
        debug_assert!(
            pages <= ledger.reserved_pages,
            "releasing {pages} pages with only {} reserved",
            ledger.reserved_pages
        );
        ledger.reserved_pages = ledger.reserved_pages.saturating_sub(pages);
        ledger.released_pages_total += pages;

        debug!(
            pages,
            reserved_pages = ledger.reserved_pages,
            "Pages released"
        );
    }
}

impl std::fmt::Debug for GateToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateToken")
            .field("ledger", &*self.ledger)
            .finish()
    }
}
