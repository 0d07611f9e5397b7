//! Trace container reader.
//!
//! Layout: header (magic, version), five cross-reference tables, then
//! record batches until end of file. Strings are length-prefixed UTF-8.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use taskscope_common::{RawRecord, PAYLOAD_BYTES, TRACE_MAGIC, TRACE_VERSION};

use crate::domain::{ThreadId, TraceError};

/// Cross-reference tables exactly as the front-end recorded them, with
/// intra-trace indices still unresolved.
#[derive(Debug, Default)]
pub struct RawTables {
    pub images: Vec<String>,
    pub files: Vec<RawFile>,
    pub functions: Vec<RawFunction>,
    pub locations: Vec<RawLocation>,
    pub access_details: Vec<RawAccessDetails>,
}

#[derive(Debug, Clone)]
pub struct RawFile {
    pub path: String,
    pub image: u32,
}

#[derive(Debug, Clone)]
pub struct RawFunction {
    pub name: String,
    pub prototype: String,
    pub file: u32,
    pub line: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct RawLocation {
    pub function: u32,
    pub line: i32,
    pub column: i32,
}

#[derive(Debug, Clone)]
pub struct RawAccessDetails {
    pub location: u32,
    /// `(size, is_read, is_write)` per operand.
    pub operands: Vec<(u32, bool, bool)>,
}

/// One delivery of records for one observed thread.
#[derive(Debug)]
pub struct Batch {
    pub thread: ThreadId,
    pub records: Vec<RawRecord>,
}

pub struct TraceReader<R: Read> {
    input: R,
}

impl TraceReader<BufReader<File>> {
    /// Open a trace file and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> TraceReader<R> {
    pub fn new(input: R) -> Result<Self, TraceError> {
        let mut reader = Self { input };
        if reader.read_u32("header")? != TRACE_MAGIC {
            return Err(TraceError::BadMagic);
        }
        let version = reader.read_u32("header")?;
        if version != TRACE_VERSION {
            return Err(TraceError::UnsupportedVersion(version));
        }
        Ok(reader)
    }

    /// Read the five cross-reference tables that precede the batches.
    pub fn read_tables(&mut self) -> Result<RawTables, TraceError> {
        let mut tables = RawTables::default();

        for _ in 0..self.read_u32("image table")? {
            tables.images.push(self.read_string("image table")?);
        }

        for _ in 0..self.read_u32("file table")? {
            let path = self.read_string("file table")?;
            let image = self.read_u32("file table")?;
            tables.files.push(RawFile { path, image });
        }

        for _ in 0..self.read_u32("function table")? {
            let name = self.read_string("function table")?;
            let prototype = self.read_string("function table")?;
            let file = self.read_u32("function table")?;
            let line = self.read_i32("function table")?;
            tables.functions.push(RawFunction { name, prototype, file, line });
        }

        for _ in 0..self.read_u32("location table")? {
            let function = self.read_u32("location table")?;
            let line = self.read_i32("location table")?;
            let column = self.read_i32("location table")?;
            tables.locations.push(RawLocation { function, line, column });
        }

        for _ in 0..self.read_u32("access-details table")? {
            let location = self.read_u32("access-details table")?;
            let operand_count = self.read_u8("access-details table")?;
            let mut operands = Vec::with_capacity(operand_count as usize);
            for _ in 0..operand_count {
                let size = self.read_u32("access-details table")?;
                let flags = self.read_u8("access-details table")?;
                operands.push((size, flags & 1 != 0, flags & 2 != 0));
            }
            tables.access_details.push(RawAccessDetails { location, operands });
        }

        Ok(tables)
    }

    /// Read the next record batch, or `None` at a clean end of file.
    pub fn next_batch(&mut self) -> Result<Option<Batch>, TraceError> {
        let Some(thread) = self.read_u32_or_eof()? else {
            return Ok(None);
        };
        let record_count = self.read_u32("batch")?;

        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            let kind = self.read_u32("batch")?;
            let _pad = self.read_u32("batch")?;
            let mut payload = [0u8; PAYLOAD_BYTES];
            self.read_exact("batch", &mut payload)?;
            records.push(RawRecord { kind, _pad: 0, payload });
        }

        Ok(Some(Batch { thread, records }))
    }

    fn read_exact(&mut self, section: &'static str, buf: &mut [u8]) -> Result<(), TraceError> {
        self.input.read_exact(buf).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                TraceError::Truncated(section)
            } else {
                TraceError::Io(err)
            }
        })
    }

    fn read_u8(&mut self, section: &'static str) -> Result<u8, TraceError> {
        let mut buf = [0u8; 1];
        self.read_exact(section, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self, section: &'static str) -> Result<u32, TraceError> {
        let mut buf = [0u8; 4];
        self.read_exact(section, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&mut self, section: &'static str) -> Result<i32, TraceError> {
        let mut buf = [0u8; 4];
        self.read_exact(section, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// A batch boundary is the only place the file may cleanly end.
    fn read_u32_or_eof(&mut self) -> Result<Option<u32>, TraceError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.input.read(&mut buf[filled..])?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(TraceError::Truncated("batch header"))
                };
            }
            filled += n;
        }
        Ok(Some(u32::from_le_bytes(buf)))
    }

    fn read_string(&mut self, section: &'static str) -> Result<String, TraceError> {
        let len = self.read_u32(section)?;
        let mut buf = vec![0u8; len as usize];
        self.read_exact(section, &mut buf)?;
        String::from_utf8(buf).map_err(|_| TraceError::InvalidString(section))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::build::TraceBuilder;
    use crate::trace::record::Record;
    use std::io::Cursor;

    fn reader_for(builder: &TraceBuilder) -> TraceReader<Cursor<Vec<u8>>> {
        TraceReader::new(Cursor::new(builder.finish())).expect("valid header")
    }

    #[test]
    fn rejects_bad_magic() {
        let result = TraceReader::new(Cursor::new(vec![0u8; 16]));
        assert!(matches!(result, Err(TraceError::BadMagic)));
    }

    #[test]
    fn reads_tables_and_batches() {
        let mut builder = TraceBuilder::new();
        let image = builder.add_image("/usr/bin/target");
        let file = builder.add_file("src/main.c", image);
        let function = builder.add_function("main", "int main()", file, 3);
        let location = builder.add_location(function, 8, 1);
        builder.add_access_details(location, &[(4, true, false)]);
        builder.add_batch(
            7,
            &[
                Record::CallEnter { tsc: 1, rbp: 0x1000, rsp: 0x0f80, function },
                Record::Ret { tsc: 5, rsp: 0x0ff0, function },
            ],
        );

        let mut reader = reader_for(&builder);
        let tables = reader.read_tables().expect("tables");
        assert_eq!(tables.images, vec!["/usr/bin/target"]);
        assert_eq!(tables.functions.len(), 1);
        assert_eq!(tables.access_details[0].operands, vec![(4, true, false)]);

        let batch = reader.next_batch().expect("batch").expect("one batch present");
        assert_eq!(batch.thread, 7);
        assert_eq!(batch.records.len(), 2);
        assert!(reader.next_batch().expect("clean eof").is_none());
    }

    #[test]
    fn truncated_batch_is_detected() {
        let mut builder = TraceBuilder::new();
        builder.add_batch(1, &[Record::Free { tsc: 1, address: 0x10 }]);
        let mut bytes = builder.finish();
        bytes.truncate(bytes.len() - 10);

        let mut reader = TraceReader::new(Cursor::new(bytes)).expect("valid header");
        reader.read_tables().expect("empty tables");
        assert!(matches!(reader.next_batch(), Err(TraceError::Truncated(_))));
    }
}
