//! Allocation correlation.
//!
//! The allocator itself is not replaced; the front-end instruments the
//! entry and the return of the allocator routines separately. An
//! [`AllocRequest`] is paired with the address its matching exit record
//! carries through the fingerprint `(kind, thread, size, num | old_ref)`.
//! The table is shared process-wide (the manager guards it with a mutex);
//! each consumer keeps its own FIFO of requests that still await
//! application and drains it in tsc order.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{Address, ThreadId, Tsc};
use crate::trace::{AllocFingerprint, AllocRequest};

#[derive(Debug, Default)]
pub struct AllocationTable {
    /// The allocator call currently on each thread's stack.
    in_progress: HashMap<ThreadId, AllocRequest>,
    /// Completed pairings: fingerprint to entry-tsc to returned address.
    known: HashMap<AllocFingerprint, BTreeMap<Tsc, Address>>,
}

impl AllocationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An allocator routine was entered on `request.thread`.
    pub fn enter(&mut self, request: AllocRequest) {
        self.in_progress.insert(request.thread, request);
    }

    /// The allocator returned `address`; complete the thread's pending
    /// request. Returns false when no entry was outstanding.
    pub fn exit(&mut self, thread: ThreadId, address: Address) -> bool {
        let Some(request) = self.in_progress.remove(&thread) else {
            return false;
        };
        self.known.entry(request.fingerprint()).or_default().insert(request.tsc, address);
        true
    }

    /// Claim the returned address for `request`, preferring the completed
    /// pairing whose entry tsc is closest to the request's.
    pub fn claim(&mut self, request: &AllocRequest) -> Option<Address> {
        let fingerprint = request.fingerprint();
        let pairings = self.known.get_mut(&fingerprint)?;

        let below = pairings.range(..=request.tsc).next_back().map(|(tsc, _)| *tsc);
        let above = pairings.range(request.tsc..).next().map(|(tsc, _)| *tsc);
        let closest = match (below, above) {
            (Some(b), Some(a)) => {
                if request.tsc - b <= a - request.tsc {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        let address = pairings.remove(&closest);
        if pairings.is_empty() {
            self.known.remove(&fingerprint);
        }
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::AllocKind;

    fn malloc(tsc: Tsc, thread: ThreadId, size: u64) -> AllocRequest {
        AllocRequest { tsc, thread, kind: AllocKind::Malloc, size, num: 0, old_ref: 0 }
    }

    #[test]
    fn pairs_enter_with_exit() {
        let mut table = AllocationTable::new();
        let request = malloc(10, 1, 64);

        table.enter(request);
        assert!(table.exit(1, 0x7faa));
        assert_eq!(table.claim(&request), Some(0x7faa));
        // Claimed entries are gone
        assert_eq!(table.claim(&request), None);
    }

    #[test]
    fn exit_without_enter_is_reported() {
        let mut table = AllocationTable::new();
        assert!(!table.exit(3, 0x7faa));
    }

    #[test]
    fn claims_resolve_by_tsc_proximity() {
        let mut table = AllocationTable::new();
        // Two same-fingerprint allocations completed at different times
        table.enter(malloc(10, 1, 64));
        table.exit(1, 0xaaaa);
        table.enter(malloc(90, 1, 64));
        table.exit(1, 0xbbbb);

        assert_eq!(table.claim(&malloc(85, 1, 64)), Some(0xbbbb));
        assert_eq!(table.claim(&malloc(12, 1, 64)), Some(0xaaaa));
    }

    #[test]
    fn threads_do_not_share_fingerprints() {
        let mut table = AllocationTable::new();
        table.enter(malloc(10, 1, 64));
        table.exit(1, 0xaaaa);

        assert_eq!(table.claim(&malloc(10, 2, 64)), None);
        assert_eq!(table.claim(&malloc(10, 1, 64)), Some(0xaaaa));
    }
}
