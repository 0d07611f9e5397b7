//! Pre-insert id allocation.
//!
//! Rows minted in the hot path (calls, segments, instructions, accesses,
//! references, tag instances, conflicts) get their ids before the insert is
//! issued, so link rows and back-references can be built without waiting on
//! the database. Interned rows (images, files, functions, source locations)
//! use database-allocated rowids instead.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::domain::{
    AccessId, CallId, ConflictId, InstructionId, ReferenceId, SegmentId, TagInstanceId,
};

#[derive(Debug)]
pub struct IdAllocator {
    tag_instance: AtomicI64,
    call: AtomicI64,
    segment: AtomicI64,
    instruction: AtomicI64,
    reference: AtomicI64,
    access: AtomicI64,
    conflict: AtomicI64,
}

impl IdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tag_instance: AtomicI64::new(1),
            call: AtomicI64::new(1),
            segment: AtomicI64::new(1),
            instruction: AtomicI64::new(1),
            reference: AtomicI64::new(1),
            access: AtomicI64::new(1),
            conflict: AtomicI64::new(1),
        }
    }

    pub fn next_tag_instance(&self) -> TagInstanceId {
        self.tag_instance.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_call(&self) -> CallId {
        self.call.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_segment(&self) -> SegmentId {
        self.segment.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_instruction(&self) -> InstructionId {
        self.instruction.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_reference(&self) -> ReferenceId {
        self.reference.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_access(&self) -> AccessId {
        self.access.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_conflict(&self) -> ConflictId {
        self.conflict.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_are_distinct_per_entity() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next_call(), 1);
        assert_eq!(ids.next_call(), 2);
        // Separate sequences per entity
        assert_eq!(ids.next_segment(), 1);
        assert_eq!(ids.next_instruction(), 1);
    }
}
