//! The tag state machine: active-tag list, task parentage and gating.
//!
//! The active list is ordered most-recent-first so the innermost task is
//! found first. Containers (Section, Pipeline) remember every descendant
//! task instance they spawned; closing a container seals the tasks that
//! are still open and retires the whole brood from conflict detection.

use std::collections::{HashMap, HashSet};

use crate::consumer::conflicts::ConflictDetector;
use crate::domain::errors::fatal_corruption;
use crate::domain::{
    Address, Tag, TagId, TagInstance, TagInstanceId, TagInstructionKind, TagKind, ThreadId, Tsc,
};
use crate::storage::{IdAllocator, SqlWriter};

/// Gating behaviour when no tag or flag says otherwise, from the source
/// config's `flags` section.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateDefaults {
    pub process_calls: bool,
    pub process_accesses: bool,
}

#[derive(Debug)]
struct ActiveTag {
    instance: TagInstance,
    kind: TagKind,
    /// Containers: every task instance opened under this container,
    /// including ones already sealed at an iteration boundary.
    children: Vec<TagInstanceId>,
}

#[derive(Debug)]
pub struct TagState {
    defaults: GateDefaults,
    /// Open tag instances, most-recent-first.
    active: Vec<ActiveTag>,
    ignore_calls: bool,
    ignore_accesses: bool,
    process_calls: bool,
    process_accesses: bool,
    process_calls_effective: bool,
    process_accesses_effective: bool,
    /// Per-tag monotonic counter for Counter tags.
    counters: HashMap<TagId, i64>,
    /// Task instance to container instance, kept until the container
    /// closes so sealed tasks still resolve during conflict checks.
    parents: HashMap<TagInstanceId, TagInstanceId>,
    last_hit: Option<(u32, Address)>,
}

impl TagState {
    #[must_use]
    pub fn new(defaults: GateDefaults) -> Self {
        let mut state = Self {
            defaults,
            active: Vec::new(),
            ignore_calls: false,
            ignore_accesses: false,
            process_calls: false,
            process_accesses: false,
            process_calls_effective: false,
            process_accesses_effective: false,
            counters: HashMap::new(),
            parents: HashMap::new(),
            last_hit: None,
        };
        state.recompute_gate();
        state
    }

    #[must_use]
    pub fn process_calls(&self) -> bool {
        self.process_calls_effective
    }

    #[must_use]
    pub fn process_accesses(&self) -> bool {
        self.process_accesses_effective
    }

    /// Repeated hits of the same tag instruction at the same address are
    /// dropped (a tag instruction inside a tight loop fires once).
    pub fn is_duplicate_hit(&mut self, instruction: u32, address: Address) -> bool {
        if self.last_hit == Some((instruction, address)) {
            return true;
        }
        self.last_hit = Some((instruction, address));
        false
    }

    /// Ids of all open instances, innermost first.
    #[must_use]
    pub fn active_instance_ids(&self) -> Vec<TagInstanceId> {
        self.active.iter().map(|tag| tag.instance.id).collect()
    }

    /// The innermost open task instance, if any.
    #[must_use]
    pub fn current_task(&self) -> Option<TagInstanceId> {
        self.active.iter().find(|tag| tag.kind.is_task()).map(|tag| tag.instance.id)
    }

    #[must_use]
    pub fn parents(&self) -> &HashMap<TagInstanceId, TagInstanceId> {
        &self.parents
    }

    pub fn dispatch(
        &mut self,
        tag: &Tag,
        kind: TagInstructionKind,
        tsc: Tsc,
        thread: ThreadId,
        ids: &IdAllocator,
        writer: &SqlWriter,
        conflicts: &mut ConflictDetector,
    ) {
        match (tag.kind, kind) {
            (TagKind::Simple | TagKind::Pipeline, TagInstructionKind::Start) => {
                if self.position_of(tag.id).is_some() {
                    fatal_corruption(&format!("start of already-open tag '{}'", tag.name));
                }
                self.open(tag, tsc, thread, None, ids);
            }
            (TagKind::Section, TagInstructionKind::Start) => {
                // A section start sitting on a loop header re-fires; only
                // the first hit opens the instance.
                if self.position_of(tag.id).is_none() {
                    self.open(tag, tsc, thread, None, ids);
                }
            }
            (TagKind::Counter, TagInstructionKind::Start) => {
                if self.position_of(tag.id).is_some() {
                    fatal_corruption(&format!("start of already-open tag '{}'", tag.name));
                }
                let counter = self.counters.entry(tag.id).or_insert(0);
                *counter += 1;
                let counter = *counter;
                self.open(tag, tsc, thread, Some(counter), ids);
            }
            (TagKind::Simple | TagKind::Counter, TagInstructionKind::Stop) => {
                let Some(position) = self.position_of(tag.id) else {
                    fatal_corruption(&format!("stop of tag '{}' which is not open", tag.name));
                };
                self.close_at(position, tsc, writer);
            }
            (TagKind::Section | TagKind::Pipeline, TagInstructionKind::Stop) => {
                let Some(position) = self.position_of(tag.id) else {
                    fatal_corruption(&format!("stop of tag '{}' which is not open", tag.name));
                };
                self.close_container_at(position, tsc, writer, conflicts);
            }
            (TagKind::SectionTask | TagKind::PipelineTask, TagInstructionKind::Start) => {
                self.start_task(tag, tsc, thread, ids, writer);
            }
            (TagKind::SectionTask | TagKind::PipelineTask, TagInstructionKind::Stop) => {
                fatal_corruption(&format!(
                    "task tag '{}' has a stop instruction; tasks end at the next start",
                    tag.name
                ));
            }
            (TagKind::IgnoreAll, state) => {
                let value = state == TagInstructionKind::Start;
                self.ignore_calls = value;
                self.ignore_accesses = value;
            }
            (TagKind::IgnoreCalls, state) => {
                self.ignore_calls = state == TagInstructionKind::Start;
            }
            (TagKind::IgnoreAccesses, state) => {
                self.ignore_accesses = state == TagInstructionKind::Start;
            }
            (TagKind::ProcessAll, state) => {
                let value = state == TagInstructionKind::Start;
                self.process_calls = value;
                self.process_accesses = value;
            }
            (TagKind::ProcessCalls, state) => {
                self.process_calls = state == TagInstructionKind::Start;
            }
            (TagKind::ProcessAccesses, state) => {
                self.process_accesses = state == TagInstructionKind::Start;
            }
        }
        self.recompute_gate();
    }

    /// Thread end: seal everything that is still open.
    pub fn close_all(&mut self, tsc: Tsc, writer: &SqlWriter) {
        while !self.active.is_empty() {
            let mut tag = self.active.remove(0);
            tag.instance.end = tsc;
            writer.insert_tag_instance(&tag.instance);
        }
        self.parents.clear();
        self.recompute_gate();
    }

    fn position_of(&self, tag: TagId) -> Option<usize> {
        self.active.iter().position(|active| active.instance.tag == tag)
    }

    fn open(
        &mut self,
        tag: &Tag,
        tsc: Tsc,
        thread: ThreadId,
        counter: Option<i64>,
        ids: &IdAllocator,
    ) -> TagInstanceId {
        let instance = TagInstance {
            id: ids.next_tag_instance(),
            tag: tag.id,
            thread,
            start: tsc,
            end: 0,
            counter,
        };
        let id = instance.id;
        self.active.insert(0, ActiveTag { instance, kind: tag.kind, children: Vec::new() });
        id
    }

    fn close_at(&mut self, position: usize, tsc: Tsc, writer: &SqlWriter) {
        let mut tag = self.active.remove(position);
        tag.instance.end = tsc;
        writer.insert_tag_instance(&tag.instance);
    }

    fn close_container_at(
        &mut self,
        position: usize,
        tsc: Tsc,
        writer: &SqlWriter,
        conflicts: &mut ConflictDetector,
    ) {
        let container_id = self.active[position].instance.id;
        let children: HashSet<TagInstanceId> =
            self.active[position].children.iter().copied().collect();

        // Seal descendant tasks that are still running, innermost first.
        while let Some(open_child) =
            self.active.iter().position(|tag| children.contains(&tag.instance.id))
        {
            self.close_at(open_child, tsc, writer);
        }

        // The container itself may have moved after the removals.
        if let Some(position) =
            self.active.iter().position(|tag| tag.instance.id == container_id)
        {
            self.close_at(position, tsc, writer);
        }

        conflicts.close_scope(&children);
        for child in &children {
            self.parents.remove(child);
        }
    }

    fn start_task(
        &mut self,
        tag: &Tag,
        tsc: Tsc,
        thread: ThreadId,
        ids: &IdAllocator,
        writer: &SqlWriter,
    ) {
        // A task start while the same task is open marks an iteration
        // boundary: the previous iteration ends here.
        if let Some(position) = self.position_of(tag.id) {
            self.close_at(position, tsc, writer);
        }

        let required = tag
            .kind
            .required_container()
            .unwrap_or_else(|| fatal_corruption("task kind without container requirement"));
        let Some(container_position) =
            self.active.iter().position(|active| active.kind == required)
        else {
            fatal_corruption(&format!(
                "task tag '{}' started outside its {required:?} container",
                tag.name
            ));
        };
        let container_id = self.active[container_position].instance.id;

        let id = self.open(tag, tsc, thread, None, ids);
        // `open` prepended, shifting the container down by one.
        self.active[container_position + 1].children.push(id);
        self.parents.insert(id, container_id);
    }

    fn recompute_gate(&mut self) {
        let interesting =
            self.active.iter().any(|tag| tag.kind.is_container() || tag.kind.is_task());

        self.process_calls_effective = if self.ignore_calls {
            false
        } else if self.process_calls || interesting {
            true
        } else {
            self.defaults.process_calls
        };

        self.process_accesses_effective = if !self.process_calls_effective {
            false
        } else if self.ignore_accesses {
            false
        } else if self.process_accesses || interesting {
            true
        } else {
            self.defaults.process_accesses
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> SqlWriter {
        SqlWriter::open(":memory:").expect("in-memory database")
    }

    fn tag(id: TagId, kind: TagKind) -> Tag {
        Tag { id, name: format!("tag-{id}"), kind }
    }

    fn state() -> TagState {
        TagState::new(GateDefaults::default())
    }

    #[test]
    fn defaults_gate_everything_off() {
        let state = state();
        assert!(!state.process_calls());
        assert!(!state.process_accesses());
    }

    #[test]
    fn simple_tag_opens_and_closes() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let simple = tag(1, TagKind::Simple);

        state.dispatch(&simple, TagInstructionKind::Start, 5, 0, &ids, &writer, &mut conflicts);
        assert_eq!(state.active_instance_ids().len(), 1);

        state.dispatch(&simple, TagInstructionKind::Stop, 9, 0, &ids, &writer, &mut conflicts);
        assert!(state.active_instance_ids().is_empty());

        let (start, end): (i64, i64) = (
            writer.query_one("SELECT Start FROM TagInstance").expect("row"),
            writer.query_one("SELECT \"End\" FROM TagInstance").expect("row"),
        );
        assert_eq!((start, end), (5, 9));
    }

    #[test]
    fn section_makes_the_program_interesting() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let section = tag(1, TagKind::Section);

        state.dispatch(&section, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
        assert!(state.process_calls());
        assert!(state.process_accesses());

        state.dispatch(&section, TagInstructionKind::Stop, 2, 0, &ids, &writer, &mut conflicts);
        assert!(!state.process_calls());
    }

    #[test]
    fn section_reopen_on_loop_header_is_ignored() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let section = tag(1, TagKind::Section);

        state.dispatch(&section, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
        state.dispatch(&section, TagInstructionKind::Start, 2, 0, &ids, &writer, &mut conflicts);
        assert_eq!(state.active_instance_ids().len(), 1);
    }

    #[test]
    fn task_restart_is_an_iteration_boundary() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let section = tag(1, TagKind::Section);
        let task = tag(2, TagKind::SectionTask);

        state.dispatch(&section, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
        state.dispatch(&task, TagInstructionKind::Start, 2, 0, &ids, &writer, &mut conflicts);
        let first = state.current_task().expect("task open");

        state.dispatch(&task, TagInstructionKind::Start, 7, 0, &ids, &writer, &mut conflicts);
        let second = state.current_task().expect("task open");
        assert_ne!(first, second);

        // First iteration sealed at the boundary tsc
        let end: i64 = writer
            .query_one("SELECT \"End\" FROM TagInstance WHERE Id = 1")
            .expect("sealed row");
        assert_eq!(end, 7);

        // Both tasks answer to the same container
        assert_eq!(state.parents().get(&first), state.parents().get(&second));
    }

    #[test]
    fn container_close_seals_open_tasks() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let section = tag(1, TagKind::Section);
        let task = tag(2, TagKind::SectionTask);

        state.dispatch(&section, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
        state.dispatch(&task, TagInstructionKind::Start, 2, 0, &ids, &writer, &mut conflicts);
        state.dispatch(&section, TagInstructionKind::Stop, 9, 0, &ids, &writer, &mut conflicts);

        assert!(state.active_instance_ids().is_empty());
        assert!(state.parents().is_empty());
        let rows: i64 = writer.query_one("SELECT COUNT(*) FROM TagInstance").expect("rows");
        assert_eq!(rows, 2);
    }

    #[test]
    fn ignore_calls_wins_over_interesting_region() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let section = tag(1, TagKind::Section);
        let ignore = tag(2, TagKind::IgnoreCalls);

        state.dispatch(&section, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
        state.dispatch(&ignore, TagInstructionKind::Start, 2, 0, &ids, &writer, &mut conflicts);
        assert!(!state.process_calls());
        assert!(!state.process_accesses(), "access gate needs the call gate");

        state.dispatch(&ignore, TagInstructionKind::Stop, 3, 0, &ids, &writer, &mut conflicts);
        assert!(state.process_calls());
    }

    #[test]
    fn process_flags_force_gates_on() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let process = tag(1, TagKind::ProcessAll);

        state.dispatch(&process, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
        assert!(state.process_calls());
        assert!(state.process_accesses());

        state.dispatch(&process, TagInstructionKind::Stop, 2, 0, &ids, &writer, &mut conflicts);
        assert!(!state.process_calls());
    }

    #[test]
    fn counter_instances_carry_the_count() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();
        let counter = tag(1, TagKind::Counter);

        for round in 1..=2 {
            state.dispatch(&counter, TagInstructionKind::Start, 1, 0, &ids, &writer, &mut conflicts);
            state.dispatch(&counter, TagInstructionKind::Stop, 2, 0, &ids, &writer, &mut conflicts);
            let stored: i64 = writer
                .query_one("SELECT MAX(Counter) FROM TagInstance")
                .expect("counter value");
            assert_eq!(stored, round);
        }
    }

    #[test]
    fn duplicate_hits_are_detected() {
        let mut state = state();
        assert!(!state.is_duplicate_hit(4, 0x100));
        assert!(state.is_duplicate_hit(4, 0x100));
        assert!(!state.is_duplicate_hit(4, 0x108), "different address fires again");
        assert!(!state.is_duplicate_hit(4, 0x100), "not consecutive anymore");
    }

    #[test]
    fn close_all_seals_everything() {
        let (writer, ids) = (writer(), IdAllocator::new());
        let mut conflicts = ConflictDetector::new();
        let mut state = state();

        state.dispatch(
            &tag(1, TagKind::Section),
            TagInstructionKind::Start,
            1,
            0,
            &ids,
            &writer,
            &mut conflicts,
        );
        state.dispatch(
            &tag(2, TagKind::Simple),
            TagInstructionKind::Start,
            2,
            0,
            &ids,
            &writer,
            &mut conflicts,
        );

        state.close_all(9, &writer);
        assert!(state.active_instance_ids().is_empty());
        let rows: i64 = writer.query_one("SELECT COUNT(*) FROM TagInstance").expect("rows");
        assert_eq!(rows, 2);
        let max_end: i64 =
            writer.query_one("SELECT MAX(\"End\") FROM TagInstance").expect("ends");
        assert_eq!(max_end, 9);
    }
}
