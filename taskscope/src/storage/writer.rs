//! Append-only writer over SQLite.
//!
//! All inserts happen inside one exclusive transaction spanning the
//! writer's lifetime; the connection is serialised behind a mutex so
//! consumers on different worker threads can share one writer. Statements
//! go through the connection's statement cache.
//!
//! Any failed write terminates the process: the stored model is only
//! useful when complete.

// Addresses and tsc values are stored as i64 bit patterns.
#![allow(clippy::cast_possible_wrap)]

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::errors::storage_failure;
use crate::domain::{
    Access, Call, Conflict, FileId, Function, FunctionId, ImageId, Instruction, InstructionId,
    LocationId, Reference, Segment, SourceLocation, Tag, TagInstance, TagInstruction,
    TagInstructionId, Thread, ThreadId, Tsc,
};

use super::schema::SCHEMA;

pub struct SqlWriter {
    conn: Mutex<Connection>,
}

impl SqlWriter {
    /// Open (or create) the database and install the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the exclusive transaction the whole run writes under.
    pub fn begin(&self) {
        let conn = self.lock();
        if let Err(err) = conn.execute_batch("BEGIN EXCLUSIVE") {
            storage_failure("begin", &err);
        }
    }

    pub fn commit(&self) {
        let conn = self.lock();
        if let Err(err) = conn.execute_batch("COMMIT") {
            storage_failure("commit", &err);
        }
    }

    fn exec(&self, context: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) {
        let conn = self.lock();
        let result = conn.prepare_cached(sql).and_then(|mut stmt| stmt.execute(params));
        if let Err(err) = result {
            storage_failure(context, &err);
        }
    }

    // Interned rows: the database allocates the id.

    pub fn insert_image(&self, name: &str) -> ImageId {
        let conn = self.lock();
        let result = conn
            .prepare_cached("INSERT INTO Image(Name) VALUES(?)")
            .and_then(|mut stmt| stmt.execute(params![name]));
        match result {
            Ok(_) => conn.last_insert_rowid(),
            Err(err) => storage_failure("insert_image", &err),
        }
    }

    pub fn get_image_id_by_name(&self, name: &str) -> Option<ImageId> {
        let conn = self.lock();
        let result = conn
            .prepare_cached("SELECT Id FROM Image WHERE Name = ?")
            .and_then(|mut stmt| stmt.query_row(params![name], |row| row.get(0)).optional());
        match result {
            Ok(id) => id,
            Err(err) => storage_failure("get_image_id_by_name", &err),
        }
    }

    pub fn insert_file(&self, path: &str, image: ImageId) -> FileId {
        let conn = self.lock();
        let result = conn
            .prepare_cached("INSERT INTO File(Path, Image) VALUES(?, ?)")
            .and_then(|mut stmt| stmt.execute(params![path, image]));
        match result {
            Ok(_) => conn.last_insert_rowid(),
            Err(err) => storage_failure("insert_file", &err),
        }
    }

    pub fn insert_function(&self, function: &Function) -> FunctionId {
        let conn = self.lock();
        let result = conn
            .prepare_cached("INSERT INTO Function(Name, Prototype, File, Line) VALUES(?, ?, ?, ?)")
            .and_then(|mut stmt| {
                stmt.execute(params![
                    function.name,
                    function.prototype,
                    function.file,
                    function.line
                ])
            });
        match result {
            Ok(_) => conn.last_insert_rowid(),
            Err(err) => storage_failure("insert_function", &err),
        }
    }

    /// Find a function by the properties the front-end knows before it has
    /// an id: prototype, owning image, file path and first line.
    pub fn get_function_id_by_properties(
        &self,
        prototype: &str,
        image: ImageId,
        file: &str,
        line: i32,
    ) -> Option<FunctionId> {
        let conn = self.lock();
        let result = conn
            .prepare_cached(
                "SELECT Function.Id FROM Function \
                 JOIN File ON Function.File = File.Id \
                 WHERE Function.Prototype = ? AND File.Image = ? \
                   AND File.Path = ? AND Function.Line = ?",
            )
            .and_then(|mut stmt| {
                stmt.query_row(params![prototype, image, file, line], |row| row.get(0)).optional()
            });
        match result {
            Ok(id) => id,
            Err(err) => storage_failure("get_function_id_by_properties", &err),
        }
    }

    /// Intern a source location. Duplicate `(function, line, column)`
    /// triples resolve to the already-stored row.
    pub fn insert_source_location(&self, location: &SourceLocation) -> LocationId {
        let conn = self.lock();
        let inserted = conn
            .prepare_cached(
                "INSERT INTO SourceLocation(Function, Line, \"Column\") VALUES(?, ?, ?)",
            )
            .and_then(|mut stmt| {
                stmt.execute(params![location.function, location.line, location.column])
            });
        match inserted {
            Ok(0) => {
                // UNIQUE ... ON CONFLICT IGNORE swallowed the insert
                let result = conn
                    .prepare_cached(
                        "SELECT Id FROM SourceLocation \
                         WHERE Function = ? AND Line = ? AND \"Column\" = ?",
                    )
                    .and_then(|mut stmt| {
                        stmt.query_row(
                            params![location.function, location.line, location.column],
                            |row| row.get(0),
                        )
                    });
                match result {
                    Ok(id) => id,
                    Err(err) => storage_failure("insert_source_location", &err),
                }
            }
            Ok(_) => conn.last_insert_rowid(),
            Err(err) => storage_failure("insert_source_location", &err),
        }
    }

    pub fn get_source_location_by_id(&self, id: LocationId) -> Option<SourceLocation> {
        let conn = self.lock();
        let result = conn
            .prepare_cached(
                "SELECT Id, Function, Line, \"Column\" FROM SourceLocation WHERE Id = ?",
            )
            .and_then(|mut stmt| {
                stmt.query_row(params![id], |row| {
                    Ok(SourceLocation {
                        id: row.get(0)?,
                        function: row.get(1)?,
                        line: row.get(2)?,
                        column: row.get(3)?,
                    })
                })
                .optional()
            });
        match result {
            Ok(location) => location,
            Err(err) => storage_failure("get_source_location_by_id", &err),
        }
    }

    // Rows with pre-allocated ids: the writer trusts the id it is given.

    pub fn insert_tag(&self, tag: &Tag) {
        self.exec(
            "insert_tag",
            "INSERT INTO Tag(Id, Name, Type) VALUES(?, ?, ?)",
            &[&tag.id, &tag.name, &tag.kind.as_db()],
        );
    }

    pub fn insert_tag_instruction(&self, instruction: &TagInstruction) {
        self.exec(
            "insert_tag_instruction",
            "INSERT INTO TagInstruction(Id, Tag, Location, Type) VALUES(?, ?, ?, ?)",
            &[
                &instruction.id,
                &instruction.tag,
                &instruction.location,
                &instruction.kind.as_db(),
            ],
        );
    }

    pub fn insert_tag_instance(&self, instance: &TagInstance) {
        self.exec(
            "insert_tag_instance",
            "INSERT INTO TagInstance(Id, Tag, Thread, Start, \"End\", Counter) \
             VALUES(?, ?, ?, ?, ?, ?)",
            &[
                &instance.id,
                &instance.tag,
                &instance.thread,
                &(instance.start as i64),
                &(instance.end as i64),
                &instance.counter,
            ],
        );
    }

    pub fn insert_thread(&self, thread: &Thread) {
        self.exec(
            "insert_thread",
            "INSERT INTO Thread(Id, StartTime, StartTSC, EndTime, EndTSC) VALUES(?, ?, ?, ?, ?)",
            &[
                &thread.id,
                &thread.start_time,
                &(thread.start_tsc as i64),
                &thread.end_time,
                &(thread.end_tsc as i64),
            ],
        );
    }

    pub fn insert_call(&self, call: &Call) {
        self.exec(
            "insert_call",
            "INSERT INTO Call(Id, Thread, Function, Instruction, Start, \"End\") \
             VALUES(?, ?, ?, ?, ?, ?)",
            &[
                &call.id,
                &call.thread,
                &call.function,
                &call.instruction,
                &(call.start as i64),
                &(call.end as i64),
            ],
        );
    }

    pub fn insert_segment(&self, segment: &Segment) {
        self.exec(
            "insert_segment",
            "INSERT INTO Segment(Id, Call, Type) VALUES(?, ?, ?)",
            &[&segment.id, &segment.call, &segment.kind.as_db()],
        );
    }

    pub fn insert_instruction(&self, instruction: &Instruction) {
        self.exec(
            "insert_instruction",
            "INSERT INTO Instruction(Id, Segment, Type, Line, \"Column\") VALUES(?, ?, ?, ?, ?)",
            &[
                &instruction.id,
                &instruction.segment,
                &instruction.kind.as_db(),
                &instruction.line,
                &instruction.column,
            ],
        );
    }

    pub fn insert_instruction_tag_instance(&self, instruction: InstructionId, instance: i64) {
        self.exec(
            "insert_instruction_tag_instance",
            "INSERT INTO InstructionTagInstance(Instruction, TagInstance) VALUES(?, ?)",
            &[&instruction, &instance],
        );
    }

    pub fn insert_call_tag_instance(&self, call: i64, instance: i64) {
        self.exec(
            "insert_call_tag_instance",
            "INSERT INTO CallTagInstance(Call, TagInstance) VALUES(?, ?)",
            &[&call, &instance],
        );
    }

    pub fn insert_access(&self, access: &Access) {
        self.exec(
            "insert_access",
            "INSERT INTO Access(Id, Instruction, Reference, Position, Address, Size, Type) \
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            &[
                &access.id,
                &access.instruction,
                &access.reference,
                &access.position,
                &(access.address as i64),
                &(access.size as i64),
                &access.kind.as_db(),
            ],
        );
    }

    /// References are written lazily on first classification and replaced
    /// on deallocation once the deallocator instruction is known.
    pub fn insert_reference(&self, reference: &Reference) {
        self.exec(
            "insert_reference",
            "INSERT OR REPLACE INTO \
             Reference(Id, Name, Size, Type, Allocator, Deallocator) \
             VALUES(?, ?, ?, ?, ?, ?)",
            &[
                &reference.id,
                &reference.name,
                &(reference.size as i64),
                &reference.kind.as_db(),
                &reference.allocator,
                &reference.deallocator,
            ],
        );
    }

    pub fn insert_conflict(&self, conflict: &Conflict) {
        self.exec(
            "insert_conflict",
            "INSERT INTO Conflict(Id, TagInstance1, TagInstance2, Access1, Access2) \
             VALUES(?, ?, ?, ?, ?)",
            &[
                &conflict.id,
                &conflict.first_instance,
                &conflict.second_instance,
                &conflict.first_access,
                &conflict.second_access,
            ],
        );
    }

    pub fn insert_tag_hit(&self, tsc: Tsc, tag_instruction: TagInstructionId, thread: ThreadId) {
        self.exec(
            "insert_tag_hit",
            "INSERT INTO TagHit(Tsc, TagInstruction, Thread) VALUES(?, ?, ?)",
            &[&(tsc as i64), &tag_instruction, &thread],
        );
    }

    /// Read back a stored value for assertions.
    #[cfg(test)]
    pub fn query_one<T: rusqlite::types::FromSql>(
        &self,
        sql: &str,
    ) -> Result<T, rusqlite::Error> {
        let conn = self.lock();
        conn.query_row(sql, [], |row| row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReferenceKind, TagInstructionKind, TagKind};

    fn memory_writer() -> SqlWriter {
        SqlWriter::open(":memory:").expect("in-memory database")
    }

    #[test]
    fn interned_rows_get_database_ids() {
        let writer = memory_writer();
        let image = writer.insert_image("/usr/bin/target");
        assert_eq!(writer.get_image_id_by_name("/usr/bin/target"), Some(image));
        assert_eq!(writer.get_image_id_by_name("/does/not/exist"), None);

        let file = writer.insert_file("src/worker.c", image);
        let function = writer.insert_function(&Function {
            id: 0,
            name: "process".into(),
            prototype: "void process(int)".into(),
            file,
            line: 41,
        });
        assert_eq!(
            writer.get_function_id_by_properties("void process(int)", image, "src/worker.c", 41),
            Some(function)
        );
    }

    #[test]
    fn source_locations_are_interned_once() {
        let writer = memory_writer();
        let location = SourceLocation { id: 0, function: 3, line: 10, column: 2 };
        let first = writer.insert_source_location(&location);
        let second = writer.insert_source_location(&location);
        assert_eq!(first, second);

        let stored = writer.get_source_location_by_id(first).expect("stored location");
        assert_eq!(stored.function, 3);
        assert_eq!(stored.line, 10);
        assert_eq!(stored.column, 2);
    }

    #[test]
    fn reference_rewrite_records_the_deallocator() {
        let writer = memory_writer();
        let mut reference = Reference {
            id: 7,
            name: "7faa".into(),
            size: 64,
            kind: ReferenceKind::Heap,
            allocator: Some(12),
            deallocator: None,
        };
        writer.insert_reference(&reference);
        reference.deallocator = Some(19);
        writer.insert_reference(&reference);

        let count: i64 = writer.query_one("SELECT COUNT(*) FROM Reference").expect("count");
        assert_eq!(count, 1);
        let dealloc: i64 =
            writer.query_one("SELECT Deallocator FROM Reference WHERE Id = 7").expect("row");
        assert_eq!(dealloc, 19);
    }

    #[test]
    fn provided_ids_are_trusted() {
        let writer = memory_writer();
        writer.insert_tag(&Tag { id: 5, name: "stage".into(), kind: TagKind::Section });
        writer.insert_tag_instruction(&TagInstruction {
            id: 9,
            tag: 5,
            location: 1,
            kind: TagInstructionKind::Start,
        });
        let id: i64 = writer.query_one("SELECT Id FROM Tag").expect("tag row");
        assert_eq!(id, 5);
        let ti: i64 = writer.query_one("SELECT Id FROM TagInstruction").expect("row");
        assert_eq!(ti, 9);
    }
}
