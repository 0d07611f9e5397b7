//! Domain model: entity rows, enums, id aliases and typed errors.

pub mod entities;
pub mod errors;
pub mod types;

pub use entities::{
    Access, AccessKind, Call, Conflict, Function, Image, Instruction, InstructionKind, Reference,
    ReferenceKind, Segment, SegmentKind, SourceFile, SourceLocation, Tag, TagInstance,
    TagInstruction, TagInstructionKind, TagKind, Thread,
};
pub use errors::{fatal_corruption, storage_failure, ConfigError, TraceError};
pub use types::{
    AccessId, Address, CallId, ConflictId, FileId, FunctionId, ImageId, InstructionId, LocationId,
    ReferenceId, SegmentId, TagId, TagInstanceId, TagInstructionId, ThreadId, Tsc,
};
