//! The process-wide reference map.
//!
//! An ordered map from base address to the reference occupying it, shared
//! by every per-thread consumer and guarded by one mutex (the manager owns
//! the lock; consumers perform whole lookup-classify-insert sequences under
//! it). Stack and Parameter entries are bound to a call frame and removed
//! when that frame returns; heap entries leave on free.

use std::collections::BTreeMap;

use crate::domain::{Address, Reference, ReferenceId, ReferenceKind};

/// Size of the below-stack scratch area leaf functions may use without
/// adjusting rsp. 128 bytes on x86-64 SysV; a target-ABI parameter.
pub const RED_ZONE_BYTES: u64 = 128;

/// A reference plus its access bookkeeping. `was_accessed` gates
/// deallocator emission: a heap block that was never touched produces no
/// reference row at all.
#[derive(Debug, Clone)]
pub struct ReferenceEntry {
    pub reference: Reference,
    pub was_accessed: bool,
}

impl ReferenceEntry {
    #[must_use]
    pub fn new(reference: Reference) -> Self {
        Self { reference, was_accessed: false }
    }
}

#[derive(Debug)]
pub struct ReferenceMap {
    by_base: BTreeMap<Address, ReferenceEntry>,
    red_zone: ReferenceEntry,
}

impl ReferenceMap {
    /// The red-zone reference is a process-wide singleton materialized at
    /// startup; `red_zone_id` is its pre-allocated row id.
    #[must_use]
    pub fn new(red_zone_id: ReferenceId) -> Self {
        let reference = Reference {
            id: red_zone_id,
            name: "red zone".to_string(),
            size: RED_ZONE_BYTES,
            kind: ReferenceKind::RedZone,
            allocator: None,
            deallocator: None,
        };
        Self { by_base: BTreeMap::new(), red_zone: ReferenceEntry::new(reference) }
    }

    pub fn insert(&mut self, base: Address, entry: ReferenceEntry) {
        self.by_base.insert(base, entry);
    }

    pub fn remove(&mut self, base: Address) -> Option<ReferenceEntry> {
        self.by_base.remove(&base)
    }

    /// Exact-base lookup.
    pub fn exact(&mut self, address: Address) -> Option<&mut ReferenceEntry> {
        self.by_base.get_mut(&address)
    }

    /// Largest base `b <= address` whose extent still covers `address`.
    pub fn containing(&mut self, address: Address) -> Option<&mut ReferenceEntry> {
        self.by_base
            .range_mut(..=address)
            .next_back()
            .filter(|(base, entry)| *base + entry.reference.size > address)
            .map(|(_, entry)| entry)
    }

    pub fn red_zone(&mut self) -> &mut ReferenceEntry {
        &mut self.red_zone
    }

    /// Drop the Stack and Parameter references belonging to a returning
    /// frame: every entry based in `[rsp, rbp]`. Their deallocation is
    /// implicit and produces no writer row.
    pub fn remove_frame(&mut self, rsp: Address, rbp: Address) {
        if rsp > rbp {
            return;
        }
        let doomed: Vec<Address> = self
            .by_base
            .range(rsp..=rbp)
            .filter(|(_, entry)| {
                matches!(
                    entry.reference.kind,
                    ReferenceKind::Stack | ReferenceKind::Parameter
                )
            })
            .map(|(base, _)| *base)
            .collect();
        for base in doomed {
            self.by_base.remove(&base);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(id: ReferenceId, size: u64) -> ReferenceEntry {
        ReferenceEntry::new(Reference {
            id,
            name: format!("{id:x}"),
            size,
            kind: ReferenceKind::Heap,
            allocator: None,
            deallocator: None,
        })
    }

    fn stack(id: ReferenceId, size: u64) -> ReferenceEntry {
        ReferenceEntry::new(Reference {
            id,
            name: format!("S:{id}"),
            size,
            kind: ReferenceKind::Stack,
            allocator: None,
            deallocator: None,
        })
    }

    #[test]
    fn containing_lookup_respects_extent() {
        let mut map = ReferenceMap::new(1);
        map.insert(0x1000, heap(2, 64));

        assert!(map.exact(0x1000).is_some());
        assert!(map.containing(0x1020).is_some());
        // One past the end
        assert!(map.containing(0x1040).is_none());
        assert!(map.containing(0x0fff).is_none());
    }

    #[test]
    fn frame_removal_spares_heap_references() {
        let mut map = ReferenceMap::new(1);
        map.insert(0x0f80, stack(2, 8));
        map.insert(0x0f90, stack(3, 8));
        map.insert(0x0fa0, heap(4, 16));
        map.insert(0x2000, stack(5, 8));

        map.remove_frame(0x0f00, 0x1000);

        assert!(map.exact(0x0f80).is_none());
        assert!(map.exact(0x0f90).is_none());
        assert!(map.exact(0x0fa0).is_some(), "heap survives frame teardown");
        assert!(map.exact(0x2000).is_some(), "other frames untouched");
    }

    #[test]
    fn red_zone_is_a_singleton() {
        let mut map = ReferenceMap::new(9);
        map.red_zone().was_accessed = true;
        assert_eq!(map.red_zone().reference.id, 9);
        assert!(map.red_zone().was_accessed);
        assert!(map.is_empty());
    }
}
