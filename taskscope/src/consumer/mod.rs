//! Per-thread record consumption.
//!
//! One consumer owns all mutable state for one observed thread: the call
//! stack, the tag state machine, the pending-allocation queue and the
//! conflict table. Records arrive in stream order; the only excursions to
//! shared state are the reference map, the allocation table and the
//! writer, each behind its own lock.

// Frame offsets are signed distances between unsigned addresses.
#![allow(clippy::cast_possible_wrap)]

pub mod alloc;
pub mod call_stack;
pub mod conflicts;
pub mod tags;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use taskscope_common::RawRecord;

use crate::domain::errors::fatal_corruption;
use crate::domain::{
    Access, AccessKind, Address, Call, Conflict, Instruction, InstructionId, InstructionKind,
    Reference, ReferenceId, ReferenceKind, Segment, SegmentId, SegmentKind, Thread, ThreadId, Tsc,
};
use crate::memory::{ReferenceEntry, ReferenceMap, RED_ZONE_BYTES};
use crate::runtime::Manager;
use crate::trace::loader::{LocationDetails, Resolved};
use crate::trace::record::{decode, AllocKind, AllocRequest, Record};

use call_stack::{CallStack, Frame};
use conflicts::ConflictDetector;
use tags::TagState;

pub struct ThreadConsumer {
    manager: Arc<Manager>,
    thread: ThreadId,
    /// First tsc observed on this thread; stored tsc values are relative
    /// to it.
    start_tsc: Option<Tsc>,
    last_tsc: Tsc,
    start_time: i64,
    stack: CallStack,
    tags: TagState,
    pending_allocs: VecDeque<AllocRequest>,
    conflicts: ConflictDetector,
    /// State saved at the most recent call-site record, consumed by the
    /// matching CallEnter.
    last_call_tsc: Option<Tsc>,
    last_call_location: Option<LocationDetails>,
    records_consumed: u64,
    calls_entered: u64,
}

impl ThreadConsumer {
    #[must_use]
    pub fn new(manager: Arc<Manager>, thread: ThreadId) -> Self {
        let tags = TagState::new(manager.gate_defaults);
        Self {
            manager,
            thread,
            start_tsc: None,
            last_tsc: 0,
            start_time: unix_nanos(),
            stack: CallStack::new(),
            tags,
            pending_allocs: VecDeque::new(),
            conflicts: ConflictDetector::new(),
            last_call_tsc: None,
            last_call_location: None,
            records_consumed: 0,
            calls_entered: 0,
        }
    }

    /// Consume one raw record in stream order.
    pub fn handle_record(&mut self, raw: &RawRecord) {
        let record = match decode(raw) {
            Ok(record) => record,
            Err(err) => fatal_corruption(&err.to_string()),
        };

        let tsc = record.tsc();
        if self.start_tsc.is_none() {
            self.start_tsc = Some(tsc);
        }
        self.last_tsc = tsc;
        self.records_consumed += 1;

        match record {
            Record::AllocEnter(request) => {
                self.pending_allocs.push_back(request);
                self.manager.lock_allocations().enter(request);
            }
            Record::AllocExit { thread, address, .. } => {
                if !self.manager.lock_allocations().exit(thread, address) {
                    warn!("allocator exit without entry on thread {thread}");
                }
            }
            other => {
                self.drain_pending_allocations(tsc);
                match other {
                    Record::Tag { tsc, tag_instruction, address } => {
                        self.handle_tag(tsc, tag_instruction, address);
                    }
                    Record::CallEnter { tsc, rbp, rsp, function } if self.tags.process_calls() => {
                        self.handle_call_enter(tsc, rbp, rsp, function);
                    }
                    Record::CallSite { tsc, rsp, location } if self.tags.process_calls() => {
                        self.handle_call_site(tsc, rsp, location);
                    }
                    Record::Ret { tsc, rsp, function } if self.tags.process_calls() => {
                        self.handle_ret(tsc, rsp, function);
                    }
                    Record::MemRef { rsp, details, addresses, .. }
                        if self.tags.process_accesses() =>
                    {
                        self.handle_mem_ref(rsp, details, addresses);
                    }
                    Record::Free { tsc, address } => self.apply_free(tsc, address),
                    _ => {} // gated off
                }
            }
        }
    }

    /// Thread end: close whatever is still open, then write the thread
    /// row itself.
    pub fn finish(&mut self) {
        let end_tsc = self.last_tsc;

        if !self.stack.is_empty() {
            debug!(
                "thread {} ended with {} open calls; closing them",
                self.thread,
                self.stack.depth()
            );
        }
        while let Some(rsp) = self.stack.top().map(|frame| frame.rsp) {
            self.close_top_frame(end_tsc, rsp);
        }

        // Allocations whose pairing arrived are still applied; the rest
        // never completed and are dropped.
        self.drain_pending_allocations(Tsc::MAX);
        self.pending_allocs.clear();

        self.tags.close_all(self.rel(end_tsc), &self.manager.writer);

        self.manager.writer.insert_thread(&Thread {
            id: self.thread,
            start_time: self.start_time,
            start_tsc: self.start_tsc.unwrap_or(0),
            end_time: unix_nanos(),
            end_tsc,
        });

        debug!(
            "thread {}: {} records, {} calls entered",
            self.thread, self.records_consumed, self.calls_entered
        );
    }

    fn rel(&self, tsc: Tsc) -> Tsc {
        tsc.saturating_sub(self.start_tsc.unwrap_or(tsc))
    }

    // Tag records

    fn handle_tag(&mut self, tsc: Tsc, tag_instruction: u32, address: Address) {
        if self.tags.is_duplicate_hit(tag_instruction, address) {
            return;
        }

        let instruction_id = i64::from(tag_instruction);
        let (tag, kind) = {
            let Some(instruction) = self.manager.tag_instructions.get(&instruction_id) else {
                fatal_corruption(&format!("unknown tag instruction {tag_instruction}"));
            };
            let Some(tag) = self.manager.tags.get(&instruction.tag) else {
                fatal_corruption(&format!("tag instruction {tag_instruction} names unknown tag"));
            };
            (tag.clone(), instruction.kind)
        };

        let tsc = self.rel(tsc);
        self.manager.writer.insert_tag_hit(tsc, instruction_id, self.thread);
        self.tags.dispatch(
            &tag,
            kind,
            tsc,
            self.thread,
            &self.manager.ids,
            &self.manager.writer,
            &mut self.conflicts,
        );
    }

    // Call records

    fn handle_call_site(&mut self, tsc: Tsc, rsp: Address, location: u32) {
        self.last_call_tsc = Some(tsc);
        self.last_call_location = match self.manager.tables.location(location) {
            Resolved::OutOfRange => {
                fatal_corruption(&format!("call site names unknown location {location}"))
            }
            Resolved::Filtered => None,
            Resolved::Known(details) => Some(*details),
        };
        if let Some(top) = self.stack.top_mut() {
            top.rsp = rsp;
        }
    }

    fn handle_call_enter(&mut self, tsc: Tsc, rbp: Address, rsp: Address, function: u32) {
        let function = match self.manager.tables.function(function) {
            Resolved::OutOfRange => {
                fatal_corruption(&format!("call enter names unknown function {function}"))
            }
            Resolved::Filtered => return,
            Resolved::Known(id) => id,
        };

        // Frame-pointer-omitting prologues report rbp below rsp.
        let rbp = if rbp < rsp { rsp } else { rbp };

        let call_id = self.manager.ids.next_call();
        let segment_id = self.manager.ids.next_segment();
        self.manager.writer.insert_segment(&Segment {
            id: segment_id,
            call: call_id,
            kind: SegmentKind::Standard,
        });

        let parent_instruction = if self.stack.is_empty() {
            None
        } else {
            self.materialize_call_instruction()
        };

        // A call already on the stack when instrumentation began has no
        // call-site record; it starts at its own entry.
        let start = if self.stack.is_empty() {
            tsc
        } else {
            self.last_call_tsc.unwrap_or(tsc)
        };

        self.stack.push(Frame {
            call: Call {
                id: call_id,
                thread: self.thread,
                function,
                instruction: parent_instruction,
                start: self.rel(start),
                end: 0,
            },
            segment: segment_id,
            rbp,
            rsp,
            tag_instances_at_entry: self.tags.active_instance_ids(),
        });
        self.calls_entered += 1;
    }

    /// The Call-kind instruction in the caller's segment, at the saved
    /// call-site location.
    fn materialize_call_instruction(&self) -> Option<InstructionId> {
        let segment = self.stack.top().map(|frame| frame.segment)?;
        let location = self.last_call_location?;
        Some(self.materialize_instruction(segment, InstructionKind::Call, &location))
    }

    fn materialize_instruction(
        &self,
        segment: SegmentId,
        kind: InstructionKind,
        location: &LocationDetails,
    ) -> InstructionId {
        let id = self.manager.ids.next_instruction();
        self.manager.writer.insert_instruction(&Instruction {
            id,
            segment,
            kind,
            line: location.line,
            column: location.column,
        });
        for instance in self.tags.active_instance_ids() {
            self.manager.writer.insert_instruction_tag_instance(id, instance);
        }
        id
    }

    fn handle_ret(&mut self, tsc: Tsc, rsp: Address, function: u32) {
        let function = match self.manager.tables.function(function) {
            Resolved::OutOfRange => {
                fatal_corruption(&format!("return names unknown function {function}"))
            }
            Resolved::Filtered => return,
            Resolved::Known(id) => id,
        };

        loop {
            let Some(top_function) = self.stack.top().map(|frame| frame.call.function) else {
                warn!(
                    "thread {}: return from function {function} with no matching call",
                    self.thread
                );
                return;
            };
            let matched = top_function == function;
            if !matched {
                warn!(
                    "thread {}: return from function {function} while {top_function} is on top; \
                     forcing it closed",
                    self.thread
                );
            }
            self.close_top_frame(tsc, rsp);
            if matched {
                return;
            }
        }
    }

    fn close_top_frame(&mut self, tsc: Tsc, rsp: Address) {
        let Some(mut frame) = self.stack.pop() else {
            return;
        };

        // Stack and Parameter references of this frame die with it.
        self.manager.lock_references().remove_frame(rsp, frame.rbp);

        for instance in &frame.tag_instances_at_entry {
            self.manager.writer.insert_call_tag_instance(frame.call.id, *instance);
        }

        frame.call.end = self.rel(tsc);
        self.manager.writer.insert_call(&frame.call);
    }

    // Access records

    fn handle_mem_ref(
        &mut self,
        rsp: Address,
        details: u32,
        addresses: [Address; taskscope_common::MAX_MEMORY_OPERANDS],
    ) {
        let details = match self.manager.tables.access_details(details) {
            Resolved::OutOfRange => {
                fatal_corruption(&format!("access names unknown details entry {details}"))
            }
            Resolved::Filtered => return,
            Resolved::Known(details) => details.clone(),
        };

        // Accesses only materialize inside an active segment.
        let Some(segment) = self.stack.top().map(|frame| frame.segment) else {
            return;
        };

        let instruction =
            self.materialize_instruction(segment, InstructionKind::Access, &details.location);

        let task = self.tags.current_task();
        let site_ignored = self
            .manager
            .conflict_ignore_sites
            .contains(&(details.location.function, details.location.line));

        for (position, operand) in details.operands.iter().enumerate() {
            let Some(&address) = addresses.get(position) else {
                break;
            };
            let kind = if operand.is_write { AccessKind::Write } else { AccessKind::Read };
            let reference = self.resolve_reference(address, operand.size, rsp);

            let access = Access {
                id: self.manager.ids.next_access(),
                instruction,
                reference,
                position: u8::try_from(position).unwrap_or(u8::MAX),
                address,
                size: operand.size,
                kind,
            };
            self.manager.writer.insert_access(&access);

            if let Some(task) = task {
                if !site_ignored {
                    let hits = self.conflicts.record(
                        reference,
                        address,
                        task,
                        access.id,
                        kind,
                        self.tags.parents(),
                    );
                    for hit in hits {
                        self.manager.writer.insert_conflict(&Conflict {
                            id: self.manager.ids.next_conflict(),
                            first_instance: task,
                            second_instance: hit.other_instance,
                            first_access: access.id,
                            second_access: hit.other_access,
                        });
                    }
                }
            }
        }
    }

    /// Classify one address into a reference, creating and persisting new
    /// references as needed. Runs entirely under the reference lock.
    fn resolve_reference(&self, address: Address, size: u64, rsp: Address) -> ReferenceId {
        let mut references = self.manager.lock_references();

        if let Some(entry) = references.exact(address) {
            return touch(entry, &self.manager);
        }
        if let Some(entry) = references.containing(address) {
            return touch(entry, &self.manager);
        }

        // Slot in the current frame
        if let Some(top) = self.stack.top() {
            if rsp <= address && address < top.rbp {
                return self.create_reference(
                    &mut references,
                    address,
                    stack_slot_name(address, top),
                    size,
                    ReferenceKind::Stack,
                );
            }
        }

        // The scratch area just below the stack pointer
        if rsp.saturating_sub(RED_ZONE_BYTES) <= address && address < rsp {
            return touch(references.red_zone(), &self.manager);
        }

        // Enclosing frames, innermost first
        for frame in self.stack.iter_top_down() {
            if frame.rsp <= address && address < frame.rbp {
                return self.create_reference(
                    &mut references,
                    address,
                    stack_slot_name(address, frame),
                    size,
                    ReferenceKind::Stack,
                );
            }
            if address >= frame.rbp {
                return self.create_reference(
                    &mut references,
                    address,
                    parameter_slot_name(address, frame),
                    size,
                    ReferenceKind::Parameter,
                );
            }
        }

        self.create_reference(
            &mut references,
            address,
            format!("G:{address:x}"),
            size,
            ReferenceKind::Global,
        )
    }

    fn create_reference(
        &self,
        references: &mut ReferenceMap,
        address: Address,
        name: String,
        size: u64,
        kind: ReferenceKind,
    ) -> ReferenceId {
        let reference = Reference {
            id: self.manager.ids.next_reference(),
            name,
            size,
            kind,
            allocator: None,
            deallocator: None,
        };
        let id = reference.id;
        self.manager.writer.insert_reference(&reference);
        references.insert(address, ReferenceEntry { reference, was_accessed: true });
        id
    }

    // Allocations

    /// Apply queued allocator entries, oldest first, up to `tsc`. An entry
    /// whose exit record has not arrived yet blocks the queue; order
    /// within a thread is part of the model.
    fn drain_pending_allocations(&mut self, tsc: Tsc) {
        while let Some(request) = self.pending_allocs.front().copied() {
            if request.tsc > tsc {
                return;
            }
            let Some(address) = self.manager.lock_allocations().claim(&request) else {
                return;
            };
            self.pending_allocs.pop_front();
            self.apply_allocation(&request, address);
        }
    }

    fn apply_allocation(&mut self, request: &AllocRequest, address: Address) {
        match request.kind {
            AllocKind::Malloc | AllocKind::Calloc => self.apply_malloc(request, address),
            AllocKind::Realloc => {
                // A realloc is a free of the old block and a fresh
                // allocation at the returned address.
                self.apply_free(request.tsc, request.old_ref);
                self.apply_malloc(request, address);
            }
        }
    }

    fn apply_malloc(&mut self, request: &AllocRequest, address: Address) {
        if address == 0 {
            return; // failed allocation
        }

        let allocator = self.synthesize_alloc_instruction(InstructionKind::Alloc);
        let reference = Reference {
            id: self.manager.ids.next_reference(),
            name: format!("{address:x}"),
            size: request.total_size(),
            kind: ReferenceKind::Heap,
            allocator,
            deallocator: None,
        };
        // The row is written lazily, on first classification.
        self.manager
            .lock_references()
            .insert(address, ReferenceEntry::new(reference));
    }

    fn apply_free(&mut self, _tsc: Tsc, address: Address) {
        if address == 0 {
            return;
        }

        let removed = self.manager.lock_references().remove(address);
        let Some(entry) = removed else {
            warn!("thread {}: free of unknown reference {address:x}", self.thread);
            return;
        };
        // Never accessed: the block never became part of the model.
        if !entry.was_accessed {
            return;
        }

        let mut reference = entry.reference;
        reference.deallocator = self.synthesize_alloc_instruction(InstructionKind::Free);
        self.manager.writer.insert_reference(&reference);
    }

    /// Alloc and Free instructions are synthesized into the current
    /// segment at the last call-site location (the allocator call).
    fn synthesize_alloc_instruction(&self, kind: InstructionKind) -> Option<InstructionId> {
        let segment = self.stack.top().map(|frame| frame.segment)?;
        let location = self.last_call_location?;
        Some(self.materialize_instruction(segment, kind, &location))
    }
}

/// Mark an existing reference accessed, writing its row on first touch.
fn touch(entry: &mut ReferenceEntry, manager: &Manager) -> ReferenceId {
    if !entry.was_accessed {
        entry.was_accessed = true;
        manager.writer.insert_reference(&entry.reference);
    }
    entry.reference.id
}

fn stack_slot_name(address: Address, frame: &Frame) -> String {
    let offset = address as i64 - frame.rbp as i64;
    format!("S:{:x}:{}:{}", frame.rbp, offset, frame.call.function)
}

fn parameter_slot_name(address: Address, frame: &Frame) -> String {
    let offset = address as i64 - frame.rbp as i64;
    format!("P:{:x}:{}:{}", frame.rbp, offset, frame.call.function)
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
}
