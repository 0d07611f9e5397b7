//! Process-wide shared state.
//!
//! Exactly three pieces of state cross thread boundaries: the writer, the
//! reference map and the allocation table. Each has its own lock and an
//! explicit lifecycle (built at startup here, torn down when the run
//! ends). Everything else in the manager is immutable after construction.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::SourceConfig;
use crate::consumer::alloc::AllocationTable;
use crate::consumer::tags::GateDefaults;
use crate::domain::{
    FunctionId, SourceLocation, Tag, TagId, TagInstruction, TagInstructionId,
};
use crate::memory::ReferenceMap;
use crate::storage::{IdAllocator, SqlWriter};
use crate::trace::TraceTables;

pub struct Manager {
    pub writer: Arc<SqlWriter>,
    pub ids: IdAllocator,
    pub tables: TraceTables,
    pub tags: HashMap<TagId, Tag>,
    pub tag_instructions: HashMap<TagInstructionId, TagInstruction>,
    /// The map the front-end instruments from: which source locations
    /// carry which tag instruction.
    pub source_location_tag_instructions: HashMap<SourceLocation, TagInstructionId>,
    pub gate_defaults: GateDefaults,
    /// `(function, line)` sites whose accesses never count as conflicts.
    pub conflict_ignore_sites: HashSet<(FunctionId, i32)>,
    references: Mutex<ReferenceMap>,
    allocations: Mutex<AllocationTable>,
}

impl Manager {
    /// Persist the tag configuration and set up the shared state. The
    /// red-zone reference is materialized (and written) here, once per
    /// process.
    #[must_use]
    pub fn new(writer: Arc<SqlWriter>, config: &SourceConfig, tables: TraceTables) -> Self {
        for tag in &config.tags {
            writer.insert_tag(tag);
        }
        for instruction in &config.tag_instructions {
            writer.insert_tag_instruction(instruction);
        }

        let tags: HashMap<TagId, Tag> =
            config.tags.iter().map(|tag| (tag.id, tag.clone())).collect();
        let tag_instructions: HashMap<TagInstructionId, TagInstruction> = config
            .tag_instructions
            .iter()
            .map(|instruction| (instruction.id, instruction.clone()))
            .collect();

        let source_location_tag_instructions = config
            .tag_instructions
            .iter()
            .filter_map(|instruction| {
                writer
                    .get_source_location_by_id(instruction.location)
                    .map(|location| (location, instruction.id))
            })
            .collect();

        let ids = IdAllocator::new();
        let mut references = ReferenceMap::new(ids.next_reference());
        writer.insert_reference(&references.red_zone().reference);
        references.red_zone().was_accessed = true;

        let conflict_ignore_sites = tables.resolve_conflict_ignores(&config.conflict_ignores);

        Self {
            writer,
            ids,
            tables,
            tags,
            tag_instructions,
            source_location_tag_instructions,
            gate_defaults: GateDefaults {
                process_calls: config.process_calls_by_default,
                process_accesses: config.process_accesses_by_default,
            },
            conflict_ignore_sites,
            references: Mutex::new(references),
            allocations: Mutex::new(AllocationTable::new()),
        }
    }

    /// Whole lookup-classify-insert sequences run under this lock.
    pub fn lock_references(&self) -> MutexGuard<'_, ReferenceMap> {
        self.references.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_allocations(&self) -> MutexGuard<'_, AllocationTable> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TagInstructionKind, TagKind};

    fn config() -> SourceConfig {
        SourceConfig {
            tags: vec![crate::domain::Tag { id: 1, name: "stage".into(), kind: TagKind::Section }],
            tag_instructions: vec![TagInstruction {
                id: 1,
                tag: 1,
                location: 1,
                kind: TagInstructionKind::Start,
            }],
            process_calls_by_default: true,
            process_accesses_by_default: false,
            conflict_ignores: Vec::new(),
        }
    }

    #[test]
    fn startup_materializes_red_zone_and_tag_rows() {
        let writer = Arc::new(SqlWriter::open(":memory:").expect("in-memory database"));
        let manager = Manager::new(Arc::clone(&writer), &config(), TraceTables::default());

        let red_zone: i64 =
            writer.query_one("SELECT COUNT(*) FROM Reference WHERE Type = 5").expect("rows");
        assert_eq!(red_zone, 1);
        assert!(manager.lock_references().red_zone().was_accessed);

        let tags: i64 = writer.query_one("SELECT COUNT(*) FROM Tag").expect("rows");
        assert_eq!(tags, 1);
        assert!(manager.gate_defaults.process_calls);
        assert_eq!(manager.tags.get(&1).map(|tag| tag.kind), Some(TagKind::Section));
    }

    #[test]
    fn tag_instruction_locations_resolve_once_interned() {
        let writer = Arc::new(SqlWriter::open(":memory:").expect("in-memory database"));
        let location = writer.insert_source_location(&SourceLocation {
            id: 0,
            function: 7,
            line: 12,
            column: 3,
        });

        let mut config = config();
        config.tag_instructions[0].location = location;
        let manager = Manager::new(Arc::clone(&writer), &config, TraceTables::default());

        let key = SourceLocation { id: 0, function: 7, line: 12, column: 3 };
        assert_eq!(manager.source_location_tag_instructions.get(&key), Some(&1));
    }
}
