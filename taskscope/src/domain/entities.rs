//! Rows of the persisted execution model.
//!
//! Entities fall into two groups: interned rows supplied by the
//! instrumentation front-end (images, files, functions, source locations)
//! whose ids the database allocates, and rows minted by the consumers
//! (calls, segments, instructions, references, accesses, tag instances,
//! conflicts) whose ids are allocated up front so that link rows can be
//! written before or after the entity row itself.

use std::hash::{Hash, Hasher};

use super::types::{
    AccessId, Address, CallId, ConflictId, FileId, FunctionId, ImageId, InstructionId, LocationId,
    ReferenceId, SegmentId, TagId, TagInstanceId, TagInstructionId, ThreadId, Tsc,
};

/// A loaded binary image.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
}

/// A source file within an image.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: FileId,
    pub path: String,
    pub image: ImageId,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub prototype: String,
    pub file: FileId,
    pub line: i32,
}

/// A `(function, line, column)` triple. Equality and hashing ignore the id
/// so that locations interned at different times compare equal.
#[derive(Debug, Clone, Copy)]
pub struct SourceLocation {
    pub id: LocationId,
    pub function: FunctionId,
    pub line: i32,
    pub column: i32,
}

impl PartialEq for SourceLocation {
    fn eq(&self, other: &Self) -> bool {
        (self.function, self.line, self.column) == (other.function, other.line, other.column)
    }
}

impl Eq for SourceLocation {}

impl Hash for SourceLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.function, self.line, self.column).hash(state);
    }
}

/// The twelve tag kinds of the region/gating state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Simple,
    Counter,
    Section,
    Pipeline,
    SectionTask,
    PipelineTask,
    IgnoreAll,
    IgnoreCalls,
    IgnoreAccesses,
    ProcessAll,
    ProcessCalls,
    ProcessAccesses,
}

impl TagKind {
    /// Stable database encoding.
    #[must_use]
    pub fn as_db(self) -> i64 {
        match self {
            TagKind::Simple => 0,
            TagKind::Counter => 1,
            TagKind::Section => 2,
            TagKind::Pipeline => 3,
            TagKind::SectionTask => 4,
            TagKind::PipelineTask => 5,
            TagKind::IgnoreAll => 6,
            TagKind::IgnoreCalls => 7,
            TagKind::IgnoreAccesses => 8,
            TagKind::ProcessAll => 9,
            TagKind::ProcessCalls => 10,
            TagKind::ProcessAccesses => 11,
        }
    }

    /// Parse the `type` field of a tag definition in `source.yaml`.
    #[must_use]
    pub fn from_config_name(name: &str) -> Option<TagKind> {
        Some(match name {
            "Simple" => TagKind::Simple,
            "Counter" => TagKind::Counter,
            "Section" => TagKind::Section,
            "Pipeline" => TagKind::Pipeline,
            "SectionTask" => TagKind::SectionTask,
            "PipelineTask" => TagKind::PipelineTask,
            "IgnoreAll" => TagKind::IgnoreAll,
            "IgnoreCalls" => TagKind::IgnoreCalls,
            "IgnoreAccesses" => TagKind::IgnoreAccesses,
            "ProcessAll" => TagKind::ProcessAll,
            "ProcessCalls" => TagKind::ProcessCalls,
            "ProcessAccesses" => TagKind::ProcessAccesses,
            _ => return None,
        })
    }

    /// Section and Pipeline scope conflict detection and gate their
    /// descendant tasks.
    #[must_use]
    pub fn is_container(self) -> bool {
        matches!(self, TagKind::Section | TagKind::Pipeline)
    }

    #[must_use]
    pub fn is_task(self) -> bool {
        matches!(self, TagKind::SectionTask | TagKind::PipelineTask)
    }

    /// The container kind a task tag requires among its ancestors.
    #[must_use]
    pub fn required_container(self) -> Option<TagKind> {
        match self {
            TagKind::SectionTask => Some(TagKind::Section),
            TagKind::PipelineTask => Some(TagKind::Pipeline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub kind: TagKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagInstructionKind {
    Start,
    Stop,
}

impl TagInstructionKind {
    #[must_use]
    pub fn as_db(self) -> i64 {
        match self {
            TagInstructionKind::Start => 0,
            TagInstructionKind::Stop => 1,
        }
    }

    #[must_use]
    pub fn from_config_name(name: &str) -> Option<TagInstructionKind> {
        match name {
            "Start" => Some(TagInstructionKind::Start),
            "Stop" => Some(TagInstructionKind::Stop),
            _ => None,
        }
    }
}

/// A Start or Stop marker bound to a source location.
#[derive(Debug, Clone)]
pub struct TagInstruction {
    pub id: TagInstructionId,
    pub tag: TagId,
    pub location: LocationId,
    pub kind: TagInstructionKind,
}

/// One concrete open/closed occurrence of a tag within one thread.
#[derive(Debug, Clone)]
pub struct TagInstance {
    pub id: TagInstanceId,
    pub tag: TagId,
    pub thread: ThreadId,
    pub start: Tsc,
    pub end: Tsc,
    /// Counter tags only.
    pub counter: Option<i64>,
}

/// An observed target thread. Times are unix nanoseconds anchoring the
/// thread's relative tsc values to the wall clock.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub start_time: i64,
    pub start_tsc: Tsc,
    pub end_time: i64,
    pub end_tsc: Tsc,
}

/// One invocation of an instrumented function.
#[derive(Debug, Clone)]
pub struct Call {
    pub id: CallId,
    pub thread: ThreadId,
    pub function: FunctionId,
    /// The Call-kind instruction in the parent frame's segment, or None for
    /// a call already on the stack when instrumentation began.
    pub instruction: Option<InstructionId>,
    pub start: Tsc,
    pub end: Tsc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Standard,
    Loop,
}

impl SegmentKind {
    #[must_use]
    pub fn as_db(self) -> i64 {
        match self {
            SegmentKind::Standard => 0,
            SegmentKind::Loop => 1,
        }
    }
}

/// A portion of a call; one Standard segment is created per call on push.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: SegmentId,
    pub call: CallId,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Call,
    Access,
    Alloc,
    Free,
}

impl InstructionKind {
    #[must_use]
    pub fn as_db(self) -> i64 {
        match self {
            InstructionKind::Call => 0,
            InstructionKind::Access => 1,
            InstructionKind::Alloc => 2,
            InstructionKind::Free => 3,
        }
    }
}

/// An interesting emission materialized inside an active segment.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: InstructionId,
    pub segment: SegmentId,
    pub kind: InstructionKind,
    pub line: i32,
    pub column: i32,
}

/// Classification of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Heap,
    Stack,
    Parameter,
    Static,
    Global,
    RedZone,
    Unknown,
}

impl ReferenceKind {
    #[must_use]
    pub fn as_db(self) -> i64 {
        match self {
            ReferenceKind::Heap => 0,
            ReferenceKind::Stack => 1,
            ReferenceKind::Parameter => 2,
            ReferenceKind::Static => 3,
            ReferenceKind::Global => 4,
            ReferenceKind::RedZone => 5,
            ReferenceKind::Unknown => 6,
        }
    }
}

/// The semantic identity of a memory object. Written at most once when
/// first classified, then again on deallocation to record the deallocator.
#[derive(Debug, Clone)]
pub struct Reference {
    pub id: ReferenceId,
    pub name: String,
    pub size: u64,
    pub kind: ReferenceKind,
    pub allocator: Option<InstructionId>,
    pub deallocator: Option<InstructionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    #[must_use]
    pub fn as_db(self) -> i64 {
        match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
        }
    }
}

/// One operand of a memory instruction hitting one reference.
#[derive(Debug, Clone)]
pub struct Access {
    pub id: AccessId,
    pub instruction: InstructionId,
    pub reference: ReferenceId,
    /// Operand position within the instruction, 0-based.
    pub position: u8,
    pub address: Address,
    pub size: u64,
    pub kind: AccessKind,
}

/// Two sibling tasks touched the same location with at least one writer.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub id: ConflictId,
    pub first_instance: TagInstanceId,
    pub second_instance: TagInstanceId,
    pub first_access: AccessId,
    pub second_access: AccessId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_location_equality_ignores_id() {
        let a = SourceLocation { id: 1, function: 7, line: 12, column: 4 };
        let b = SourceLocation { id: 99, function: 7, line: 12, column: 4 };
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn tag_kind_config_names_round_trip() {
        for name in [
            "Simple",
            "Counter",
            "Section",
            "Pipeline",
            "SectionTask",
            "PipelineTask",
            "IgnoreAll",
            "IgnoreCalls",
            "IgnoreAccesses",
            "ProcessAll",
            "ProcessCalls",
            "ProcessAccesses",
        ] {
            assert!(TagKind::from_config_name(name).is_some(), "{name} should parse");
        }
        assert!(TagKind::from_config_name("Sectional").is_none());
    }

    #[test]
    fn task_kinds_name_their_container() {
        assert_eq!(TagKind::SectionTask.required_container(), Some(TagKind::Section));
        assert_eq!(TagKind::PipelineTask.required_container(), Some(TagKind::Pipeline));
        assert_eq!(TagKind::Simple.required_container(), None);
    }
}
