//! Decoding of raw wire records into the dispatchable sum type.

use taskscope_common::{
    AllocEnterRecord, AllocExitRecord, CallEnterRecord, CallSiteRecord, FreeRecord, MemRefRecord,
    RawRecord, RetRecord, TagRecord, ALLOC_CALLOC, ALLOC_MALLOC, ALLOC_REALLOC,
    MAX_MEMORY_OPERANDS, PAYLOAD_BYTES, RECORD_ALLOC_ENTER, RECORD_ALLOC_EXIT, RECORD_CALL_ENTER,
    RECORD_CALL_SITE, RECORD_FREE, RECORD_MEM_REF, RECORD_RET, RECORD_TAG,
};

use crate::domain::{Address, ThreadId, Tsc};

/// One decoded record. Table references stay as raw indices; the consumer
/// resolves them through the loaded cross-reference tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    CallEnter { tsc: Tsc, rbp: Address, rsp: Address, function: u32 },
    CallSite { tsc: Tsc, rsp: Address, location: u32 },
    Ret { tsc: Tsc, rsp: Address, function: u32 },
    Tag { tsc: Tsc, tag_instruction: u32, address: Address },
    MemRef { tsc: Tsc, rsp: Address, details: u32, addresses: [Address; MAX_MEMORY_OPERANDS] },
    AllocEnter(AllocRequest),
    AllocExit { tsc: Tsc, thread: ThreadId, address: Address },
    Free { tsc: Tsc, address: Address },
}

impl Record {
    #[must_use]
    pub fn tsc(&self) -> Tsc {
        match *self {
            Record::CallEnter { tsc, .. }
            | Record::CallSite { tsc, .. }
            | Record::Ret { tsc, .. }
            | Record::Tag { tsc, .. }
            | Record::MemRef { tsc, .. }
            | Record::AllocEnter(AllocRequest { tsc, .. })
            | Record::AllocExit { tsc, .. }
            | Record::Free { tsc, .. } => tsc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocKind {
    Malloc,
    Calloc,
    Realloc,
}

/// An allocator entry: what was requested, not yet where it landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub tsc: Tsc,
    pub thread: ThreadId,
    pub kind: AllocKind,
    pub size: u64,
    /// calloc element count; zero otherwise.
    pub num: u64,
    /// realloc source reference; zero otherwise.
    pub old_ref: Address,
}

impl AllocRequest {
    /// The correlation key pairing this request with its returned address.
    /// The distinguishing third component depends on the kind: calloc adds
    /// the element count, realloc the old reference.
    #[must_use]
    pub fn fingerprint(&self) -> AllocFingerprint {
        let extra = match self.kind {
            AllocKind::Malloc => 0,
            AllocKind::Calloc => self.num,
            AllocKind::Realloc => self.old_ref,
        };
        AllocFingerprint { kind: self.kind, thread: self.thread, size: self.size, extra }
    }

    /// Total bytes the request asked for.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        match self.kind {
            AllocKind::Calloc => self.num.saturating_mul(self.size),
            _ => self.size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocFingerprint {
    kind: AllocKind,
    thread: ThreadId,
    size: u64,
    extra: u64,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown record discriminator {0}")]
    UnknownDiscriminator(u32),

    #[error("unknown allocation kind {0}")]
    UnknownAllocKind(u32),
}

fn payload<T: Copy>(raw: &RawRecord) -> T {
    const { assert!(std::mem::size_of::<T>() <= PAYLOAD_BYTES) };
    // SAFETY: every payload struct is repr(C) with only integer fields, so
    // any bit pattern is a valid value, and the compile-time assert bounds
    // the read within the payload slot.
    #[allow(unsafe_code)]
    unsafe {
        std::ptr::read_unaligned(raw.payload.as_ptr().cast::<T>())
    }
}

/// Decode one wire record.
pub fn decode(raw: &RawRecord) -> Result<Record, DecodeError> {
    Ok(match raw.kind {
        RECORD_CALL_ENTER => {
            let entry: CallEnterRecord = payload(raw);
            Record::CallEnter {
                tsc: entry.tsc,
                rbp: entry.rbp,
                rsp: entry.rsp,
                function: entry.function,
            }
        }
        RECORD_CALL_SITE => {
            let entry: CallSiteRecord = payload(raw);
            Record::CallSite { tsc: entry.tsc, rsp: entry.rsp, location: entry.location }
        }
        RECORD_RET => {
            let entry: RetRecord = payload(raw);
            Record::Ret { tsc: entry.tsc, rsp: entry.rsp, function: entry.function }
        }
        RECORD_TAG => {
            let entry: TagRecord = payload(raw);
            Record::Tag {
                tsc: entry.tsc,
                tag_instruction: entry.tag_instruction,
                address: entry.address,
            }
        }
        RECORD_MEM_REF => {
            let entry: MemRefRecord = payload(raw);
            Record::MemRef {
                tsc: entry.tsc,
                rsp: entry.rsp,
                details: entry.details,
                addresses: entry.addresses,
            }
        }
        RECORD_ALLOC_ENTER => {
            let entry: AllocEnterRecord = payload(raw);
            let kind = match entry.kind {
                ALLOC_MALLOC => AllocKind::Malloc,
                ALLOC_CALLOC => AllocKind::Calloc,
                ALLOC_REALLOC => AllocKind::Realloc,
                other => return Err(DecodeError::UnknownAllocKind(other)),
            };
            Record::AllocEnter(AllocRequest {
                tsc: entry.tsc,
                thread: entry.thread,
                kind,
                size: entry.size,
                num: entry.num,
                old_ref: entry.old_ref,
            })
        }
        RECORD_ALLOC_EXIT => {
            let entry: AllocExitRecord = payload(raw);
            Record::AllocExit { tsc: entry.tsc, thread: entry.thread, address: entry.address }
        }
        RECORD_FREE => {
            let entry: FreeRecord = payload(raw);
            Record::Free { tsc: entry.tsc, address: entry.address }
        }
        other => return Err(DecodeError::UnknownDiscriminator(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::build::encode_record;

    #[test]
    fn call_enter_round_trips() {
        let record = Record::CallEnter { tsc: 42, rbp: 0x1000, rsp: 0x0f80, function: 7 };
        assert_eq!(decode(&encode_record(&record)), Ok(record));
    }

    #[test]
    fn mem_ref_round_trips() {
        let mut addresses = [0u64; MAX_MEMORY_OPERANDS];
        addresses[0] = 0x7faa;
        addresses[1] = 0x7fb2;
        let record = Record::MemRef { tsc: 9, rsp: 0x0e00, details: 3, addresses };
        assert_eq!(decode(&encode_record(&record)), Ok(record));
    }

    #[test]
    fn alloc_enter_round_trips() {
        let record = Record::AllocEnter(AllocRequest {
            tsc: 5,
            thread: 2,
            kind: AllocKind::Calloc,
            size: 16,
            num: 4,
            old_ref: 0,
        });
        assert_eq!(decode(&encode_record(&record)), Ok(record));
    }

    #[test]
    fn unknown_discriminator_is_an_error() {
        let raw = RawRecord { kind: 99, _pad: 0, payload: [0; PAYLOAD_BYTES] };
        assert_eq!(decode(&raw), Err(DecodeError::UnknownDiscriminator(99)));
    }

    #[test]
    fn fingerprints_distinguish_kinds_and_extras() {
        let malloc =
            AllocRequest { tsc: 1, thread: 0, kind: AllocKind::Malloc, size: 64, num: 0, old_ref: 0 };
        let calloc =
            AllocRequest { tsc: 1, thread: 0, kind: AllocKind::Calloc, size: 64, num: 2, old_ref: 0 };
        assert_ne!(malloc.fingerprint(), calloc.fingerprint());

        let same = AllocRequest { tsc: 9, ..malloc };
        assert_eq!(malloc.fingerprint(), same.fingerprint());
        assert_eq!(calloc.total_size(), 128);
    }
}
