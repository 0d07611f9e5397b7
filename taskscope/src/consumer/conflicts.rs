//! Sibling-task conflict detection.
//!
//! While a task tag is active, every access lands in a per-thread table
//! keyed by reference, address and tag instance. Two entries at the same
//! location from different instances conflict when at least one of them is
//! a write, unless one instance is the other's direct container parent.
//! Closing a container removes its descendants' entries, scoping detection
//! to one Section or Pipeline at a time.

use std::collections::{HashMap, HashSet};

use crate::domain::{AccessId, AccessKind, Address, ReferenceId, TagInstanceId};

/// A conflicting prior access returned from [`ConflictDetector::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictHit {
    pub other_instance: TagInstanceId,
    pub other_access: AccessId,
}

#[derive(Debug, Default)]
pub struct ConflictDetector {
    table: HashMap<ReferenceId, HashMap<Address, HashMap<TagInstanceId, (AccessId, AccessKind)>>>,
}

impl ConflictDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access by `instance` and report which existing entries it
    /// conflicts with. `parents` maps task instances to their container
    /// instance; a pair where one side is the other's direct container is
    /// not a conflict.
    pub fn record(
        &mut self,
        reference: ReferenceId,
        address: Address,
        instance: TagInstanceId,
        access: AccessId,
        kind: AccessKind,
        parents: &HashMap<TagInstanceId, TagInstanceId>,
    ) -> Vec<ConflictHit> {
        let per_address = self.table.entry(reference).or_default().entry(address).or_default();

        // A write always takes the slot; a read only fills an empty one.
        if kind == AccessKind::Write || !per_address.contains_key(&instance) {
            per_address.insert(instance, (access, kind));
        }

        if per_address.len() < 2 {
            return Vec::new();
        }

        let own_parent = parents.get(&instance).copied();
        per_address
            .iter()
            .filter(|(other, _)| **other != instance)
            .filter(|(other, _)| own_parent != Some(**other))
            .filter(|(other, _)| parents.get(*other).copied() != Some(instance))
            .filter(|(_, (_, other_kind))| {
                kind == AccessKind::Write || *other_kind == AccessKind::Write
            })
            .map(|(other, (other_access, _))| ConflictHit {
                other_instance: *other,
                other_access: *other_access,
            })
            .collect()
    }

    /// Container close: drop every entry belonging to the given descendant
    /// task instances.
    pub fn close_scope(&mut self, descendants: &HashSet<TagInstanceId>) {
        if descendants.is_empty() {
            return;
        }
        self.table.retain(|_, per_address| {
            per_address.retain(|_, per_instance| {
                per_instance.retain(|instance, _| !descendants.contains(instance));
                !per_instance.is_empty()
            });
            !per_address.is_empty()
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_parents() -> HashMap<TagInstanceId, TagInstanceId> {
        HashMap::new()
    }

    #[test]
    fn two_writers_at_one_address_conflict() {
        let mut detector = ConflictDetector::new();
        let parents = no_parents();

        let none = detector.record(1, 0x7faa, 10, 100, AccessKind::Write, &parents);
        assert!(none.is_empty());

        let hits = detector.record(1, 0x7faa, 11, 101, AccessKind::Write, &parents);
        assert_eq!(hits, vec![ConflictHit { other_instance: 10, other_access: 100 }]);
    }

    #[test]
    fn two_readers_do_not_conflict() {
        let mut detector = ConflictDetector::new();
        let parents = no_parents();

        detector.record(1, 0x7faa, 10, 100, AccessKind::Read, &parents);
        let hits = detector.record(1, 0x7faa, 11, 101, AccessKind::Read, &parents);
        assert!(hits.is_empty());
    }

    #[test]
    fn reader_after_writer_conflicts() {
        let mut detector = ConflictDetector::new();
        let parents = no_parents();

        detector.record(1, 0x7faa, 10, 100, AccessKind::Write, &parents);
        let hits = detector.record(1, 0x7faa, 11, 101, AccessKind::Read, &parents);
        assert_eq!(hits, vec![ConflictHit { other_instance: 10, other_access: 100 }]);
    }

    #[test]
    fn container_parent_is_excluded() {
        let mut detector = ConflictDetector::new();
        let mut parents = HashMap::new();
        parents.insert(11, 10); // 10 is 11's container

        detector.record(1, 0x7faa, 10, 100, AccessKind::Write, &parents);
        let hits = detector.record(1, 0x7faa, 11, 101, AccessKind::Write, &parents);
        assert!(hits.is_empty(), "access shared with the container is not a conflict");
    }

    #[test]
    fn distinct_addresses_do_not_interact() {
        let mut detector = ConflictDetector::new();
        let parents = no_parents();

        detector.record(1, 0x7faa, 10, 100, AccessKind::Write, &parents);
        let hits = detector.record(1, 0x7fb0, 11, 101, AccessKind::Write, &parents);
        assert!(hits.is_empty());
    }

    #[test]
    fn read_does_not_displace_a_recorded_write() {
        let mut detector = ConflictDetector::new();
        let parents = no_parents();

        detector.record(1, 0x7faa, 10, 100, AccessKind::Write, &parents);
        // Same instance reads again; the write entry must survive so a
        // later sibling read still conflicts against it.
        detector.record(1, 0x7faa, 10, 102, AccessKind::Read, &parents);
        let hits = detector.record(1, 0x7faa, 11, 103, AccessKind::Read, &parents);
        assert_eq!(hits, vec![ConflictHit { other_instance: 10, other_access: 100 }]);
    }

    #[test]
    fn scope_close_forgets_descendants() {
        let mut detector = ConflictDetector::new();
        let parents = no_parents();

        detector.record(1, 0x7faa, 10, 100, AccessKind::Write, &parents);
        detector.close_scope(&HashSet::from([10]));
        assert!(detector.is_empty());

        let hits = detector.record(1, 0x7faa, 11, 101, AccessKind::Write, &parents);
        assert!(hits.is_empty(), "closed scope must not produce conflicts");
    }
}
