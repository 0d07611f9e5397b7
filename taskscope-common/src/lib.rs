#![cfg_attr(not(test), no_std)]

// Wire format shared between the instrumentation front-end and the
// trace-consumption core. The front-end appends fixed-size records to
// per-thread buffers; the core replays them from the trace container.
//
// All multi-byte fields are little-endian. Every record is RECORD_BYTES
// long: a 4-byte discriminator, 4 bytes of padding and a payload padded
// to the largest variant (MemRef).

/// Record discriminators.
pub const RECORD_CALL_ENTER: u32 = 0; // entry of the callee
pub const RECORD_CALL_SITE: u32 = 1; // call instruction, before transfer
pub const RECORD_RET: u32 = 2;
pub const RECORD_TAG: u32 = 3;
pub const RECORD_MEM_REF: u32 = 4;
pub const RECORD_ALLOC_ENTER: u32 = 5;
pub const RECORD_ALLOC_EXIT: u32 = 6;
pub const RECORD_FREE: u32 = 7;

/// Allocation request kinds carried by [`AllocEnterRecord`].
pub const ALLOC_MALLOC: u32 = 1;
pub const ALLOC_CALLOC: u32 = 2;
pub const ALLOC_REALLOC: u32 = 3;

/// A memory instruction touches at most this many operands.
pub const MAX_MEMORY_OPERANDS: usize = 7;

/// Payload size, padded to the largest variant ([`MemRefRecord`]).
pub const PAYLOAD_BYTES: usize = 80;

/// Total on-wire size of one record.
pub const RECORD_BYTES: usize = 88;

/// Trace container magic, `b"TSCP"` read as a little-endian u32.
pub const TRACE_MAGIC: u32 = 0x5043_5354;

/// Trace container format version this crate describes.
pub const TRACE_VERSION: u32 = 1;

/// An undecoded record as it appears on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawRecord {
    pub kind: u32,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
    pub payload: [u8; PAYLOAD_BYTES],
}

/// Emitted at the entry point of an instrumented function.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallEnterRecord {
    pub tsc: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub function: u32, // function-table index
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
}

/// Emitted at a call instruction, before control transfers to the callee.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallSiteRecord {
    pub tsc: u64,
    pub rsp: u64,
    pub location: u32, // source-location-table index of the call site
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
}

/// Emitted at the ret instruction of an instrumented function.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RetRecord {
    pub tsc: u64,
    pub rsp: u64,
    pub function: u32, // function-table index
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
}

/// Emitted when a tag instruction is hit.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TagRecord {
    pub tsc: u64,
    pub tag_instruction: u32,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
    /// Address of the instrumented instruction, used for hit de-duplication.
    pub address: u64,
}

/// Emitted before a memory instruction executes. Operand sizes and
/// read/write direction live in the access-details table; the record only
/// carries the effective addresses.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemRefRecord {
    pub tsc: u64,
    pub rsp: u64,
    pub details: u32, // access-details-table index
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
    /// Effective addresses; entries past the operand count are zero.
    pub addresses: [u64; MAX_MEMORY_OPERANDS],
}

/// Emitted on entry to an allocator routine. The returned address arrives
/// separately in an [`AllocExitRecord`] correlated by fingerprint
/// `(kind, thread, size, num, old_ref)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AllocEnterRecord {
    pub tsc: u64,
    pub thread: u32,
    pub kind: u32, // ALLOC_MALLOC / ALLOC_CALLOC / ALLOC_REALLOC
    pub size: u64,
    pub num: u64,     // calloc only
    pub old_ref: u64, // realloc only
}

/// Emitted when an allocator routine returns.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AllocExitRecord {
    pub tsc: u64,
    pub thread: u32,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
    pub address: u64,
}

/// Emitted on entry to `free`. No exit pairing is needed.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FreeRecord {
    pub tsc: u64,
    pub address: u64,
}

/// Precedes each record batch in the trace container.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BatchHeader {
    pub thread: u32,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn record_is_wire_sized() {
        assert_eq!(size_of::<RawRecord>(), RECORD_BYTES);
    }

    #[test]
    fn payloads_fit_the_padded_slot() {
        assert!(size_of::<CallEnterRecord>() <= PAYLOAD_BYTES);
        assert!(size_of::<CallSiteRecord>() <= PAYLOAD_BYTES);
        assert!(size_of::<RetRecord>() <= PAYLOAD_BYTES);
        assert!(size_of::<TagRecord>() <= PAYLOAD_BYTES);
        assert_eq!(size_of::<MemRefRecord>(), PAYLOAD_BYTES);
        assert!(size_of::<AllocEnterRecord>() <= PAYLOAD_BYTES);
        assert!(size_of::<AllocExitRecord>() <= PAYLOAD_BYTES);
        assert!(size_of::<FreeRecord>() <= PAYLOAD_BYTES);
    }
}
