//! Trace container encoding.
//!
//! The inverse of [`super::reader`]: assembles cross-reference tables and
//! record batches into container bytes. The instrumentation front-end
//! writes this format natively; here it backs the test fixtures and the
//! fixture-generation tooling.

use taskscope_common::{
    RawRecord, ALLOC_CALLOC, ALLOC_MALLOC, ALLOC_REALLOC, PAYLOAD_BYTES, RECORD_ALLOC_ENTER,
    RECORD_ALLOC_EXIT, RECORD_CALL_ENTER, RECORD_CALL_SITE, RECORD_FREE, RECORD_MEM_REF,
    RECORD_RET, RECORD_TAG, TRACE_MAGIC, TRACE_VERSION,
};

use super::record::{AllocKind, AllocRequest, Record};

fn put_u32(payload: &mut [u8; PAYLOAD_BYTES], offset: usize, value: u32) {
    payload[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(payload: &mut [u8; PAYLOAD_BYTES], offset: usize, value: u64) {
    payload[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Encode one record into its wire form.
#[must_use]
pub fn encode_record(record: &Record) -> RawRecord {
    let mut payload = [0u8; PAYLOAD_BYTES];
    let kind = match *record {
        Record::CallEnter { tsc, rbp, rsp, function } => {
            put_u64(&mut payload, 0, tsc);
            put_u64(&mut payload, 8, rbp);
            put_u64(&mut payload, 16, rsp);
            put_u32(&mut payload, 24, function);
            RECORD_CALL_ENTER
        }
        Record::CallSite { tsc, rsp, location } => {
            put_u64(&mut payload, 0, tsc);
            put_u64(&mut payload, 8, rsp);
            put_u32(&mut payload, 16, location);
            RECORD_CALL_SITE
        }
        Record::Ret { tsc, rsp, function } => {
            put_u64(&mut payload, 0, tsc);
            put_u64(&mut payload, 8, rsp);
            put_u32(&mut payload, 16, function);
            RECORD_RET
        }
        Record::Tag { tsc, tag_instruction, address } => {
            put_u64(&mut payload, 0, tsc);
            put_u32(&mut payload, 8, tag_instruction);
            put_u64(&mut payload, 16, address);
            RECORD_TAG
        }
        Record::MemRef { tsc, rsp, details, addresses } => {
            put_u64(&mut payload, 0, tsc);
            put_u64(&mut payload, 8, rsp);
            put_u32(&mut payload, 16, details);
            for (index, address) in addresses.iter().enumerate() {
                put_u64(&mut payload, 24 + index * 8, *address);
            }
            RECORD_MEM_REF
        }
        Record::AllocEnter(AllocRequest { tsc, thread, kind, size, num, old_ref }) => {
            put_u64(&mut payload, 0, tsc);
            put_u32(&mut payload, 8, thread);
            let wire_kind = match kind {
                AllocKind::Malloc => ALLOC_MALLOC,
                AllocKind::Calloc => ALLOC_CALLOC,
                AllocKind::Realloc => ALLOC_REALLOC,
            };
            put_u32(&mut payload, 12, wire_kind);
            put_u64(&mut payload, 16, size);
            put_u64(&mut payload, 24, num);
            put_u64(&mut payload, 32, old_ref);
            RECORD_ALLOC_ENTER
        }
        Record::AllocExit { tsc, thread, address } => {
            put_u64(&mut payload, 0, tsc);
            put_u32(&mut payload, 8, thread);
            put_u64(&mut payload, 16, address);
            RECORD_ALLOC_EXIT
        }
        Record::Free { tsc, address } => {
            put_u64(&mut payload, 0, tsc);
            put_u64(&mut payload, 8, address);
            RECORD_FREE
        }
    };
    RawRecord { kind, _pad: 0, payload }
}

/// Assembles a trace container in memory.
#[derive(Debug, Default)]
pub struct TraceBuilder {
    images: Vec<String>,
    files: Vec<(String, u32)>,
    functions: Vec<(String, String, u32, i32)>,
    locations: Vec<(u32, i32, i32)>,
    access_details: Vec<(u32, Vec<(u32, bool, bool)>)>,
    batches: Vec<(u32, Vec<RawRecord>)>,
}

impl TraceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, name: &str) -> u32 {
        self.images.push(name.to_string());
        last_index(self.images.len())
    }

    pub fn add_file(&mut self, path: &str, image: u32) -> u32 {
        self.files.push((path.to_string(), image));
        last_index(self.files.len())
    }

    pub fn add_function(&mut self, name: &str, prototype: &str, file: u32, line: i32) -> u32 {
        self.functions.push((name.to_string(), prototype.to_string(), file, line));
        last_index(self.functions.len())
    }

    pub fn add_location(&mut self, function: u32, line: i32, column: i32) -> u32 {
        self.locations.push((function, line, column));
        last_index(self.locations.len())
    }

    /// Operands are `(size, is_read, is_write)`.
    pub fn add_access_details(&mut self, location: u32, operands: &[(u32, bool, bool)]) -> u32 {
        self.access_details.push((location, operands.to_vec()));
        last_index(self.access_details.len())
    }

    pub fn add_batch(&mut self, thread: u32, records: &[Record]) {
        self.batches.push((thread, records.iter().map(encode_record).collect()));
    }

    #[must_use]
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, TRACE_MAGIC);
        write_u32(&mut out, TRACE_VERSION);

        write_u32(&mut out, count(self.images.len()));
        for name in &self.images {
            write_string(&mut out, name);
        }

        write_u32(&mut out, count(self.files.len()));
        for (path, image) in &self.files {
            write_string(&mut out, path);
            write_u32(&mut out, *image);
        }

        write_u32(&mut out, count(self.functions.len()));
        for (name, prototype, file, line) in &self.functions {
            write_string(&mut out, name);
            write_string(&mut out, prototype);
            write_u32(&mut out, *file);
            write_i32(&mut out, *line);
        }

        write_u32(&mut out, count(self.locations.len()));
        for (function, line, column) in &self.locations {
            write_u32(&mut out, *function);
            write_i32(&mut out, *line);
            write_i32(&mut out, *column);
        }

        write_u32(&mut out, count(self.access_details.len()));
        for (location, operands) in &self.access_details {
            write_u32(&mut out, *location);
            out.push(u8::try_from(operands.len()).unwrap_or(u8::MAX));
            for (size, is_read, is_write) in operands {
                write_u32(&mut out, *size);
                out.push(u8::from(*is_read) | (u8::from(*is_write) << 1));
            }
        }

        for (thread, records) in &self.batches {
            write_u32(&mut out, *thread);
            write_u32(&mut out, count(records.len()));
            for record in records {
                write_u32(&mut out, record.kind);
                write_u32(&mut out, 0);
                out.extend_from_slice(&record.payload);
            }
        }

        out
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn last_index(len: usize) -> u32 {
    count(len) - 1
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, text: &str) {
    write_u32(out, u32::try_from(text.len()).unwrap_or(u32::MAX));
    out.extend_from_slice(text.as_bytes());
}
