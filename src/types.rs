//! Core data-model types shared by every component: undo record pointers,
//! persistence levels, record-set types, and the fixed on-page header
//! layouts (chunk header, type header sizing, page header).

use crate::config::BLCKSZ;

pub type Lsn = u64;

/// Undo record pointer: `(logno, usable-byte-offset)`. `offset` already
/// skips per-page headers; the page codec is the only place that converts
/// to `(block, page_offset)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Urp {
    pub logno: u32,
    pub offset: u64,
}

impl Urp {
    pub const INVALID: Urp = Urp {
        logno: u32::MAX,
        offset: u64::MAX,
    };

    pub fn new(logno: u32, offset: u64) -> Self {
        Urp { logno, offset }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// The page (block number) inside `logno` this usable-byte offset falls on.
    pub fn block(&self) -> u64 {
        crate::page_codec::usable_offset_to_block(self.offset)
    }

    /// The in-page offset (including the page header) for this usable-byte offset.
    pub fn page_offset(&self) -> usize {
        crate::page_codec::usable_offset_to_page_offset(self.offset)
    }

    pub fn to_le_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.logno.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn from_le_bytes(buf: &[u8]) -> Self {
        let logno = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let offset = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        Urp { logno, offset }
    }
}

impl Default for Urp {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Persistence level of a record set; only `Permanent` sets are WAL-logged.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Persistence {
    Permanent,
    Unlogged,
    Temp,
}

/// The set of record-set types known to this engine, each with a fixed
/// type-header size. `Custom` lets tests register a third type without
/// widening the enum; its size is carried alongside its type code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UndoRecordSetType {
    Transaction,
    Foo,
    Custom(u8, u8),
}

pub const URST_TRANSACTION_CODE: u8 = 0;
pub const URST_FOO_CODE: u8 = 1;

impl UndoRecordSetType {
    pub fn code(&self) -> u8 {
        match self {
            UndoRecordSetType::Transaction => URST_TRANSACTION_CODE,
            UndoRecordSetType::Foo => URST_FOO_CODE,
            UndoRecordSetType::Custom(code, _) => *code,
        }
    }

    pub fn type_header_size(&self) -> usize {
        match self {
            UndoRecordSetType::Transaction => 8,
            UndoRecordSetType::Foo => 4,
            UndoRecordSetType::Custom(_, size) => *size as usize,
        }
    }

    /// Reconstructs a type from its on-disk code. `Custom` types cannot be
    /// round-tripped this way (the size isn't recoverable from the code
    /// alone) and callers that registered one must track it out of band;
    /// this is adequate for REDO/crash-recovery, which only ever need to
    /// distinguish `Transaction` from everything else.
    pub fn from_code(code: u8) -> Self {
        match code {
            URST_TRANSACTION_CODE => UndoRecordSetType::Transaction,
            URST_FOO_CODE => UndoRecordSetType::Foo,
            other => UndoRecordSetType::Custom(other, 0),
        }
    }
}

/// On-page chunk header: `{ size: u64, previous_chunk: Urp, type: u8 (padded) }`.
/// `size == 0` marks the chunk as still open.
pub const CHUNK_HEADER_SIZE: usize = 24; // 8 (size) + 12 (Urp) + 1 (type) + 3 pad

#[derive(Clone, Copy, Debug)]
pub struct ChunkHeader {
    pub size: u64,
    pub previous_chunk: Urp,
    pub r#type: u8,
}

impl ChunkHeader {
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..20].copy_from_slice(&self.previous_chunk.to_le_bytes());
        buf[20] = self.r#type;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let size = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let previous_chunk = Urp::from_le_bytes(&buf[8..20]);
        let r#type = buf[20];
        ChunkHeader {
            size,
            previous_chunk,
            r#type,
        }
    }

    /// Offset, within the chunk header's bytes, of the `size` field. Used by
    /// `overwrite` to patch the field in place without re-encoding the rest.
    pub const SIZE_FIELD_OFFSET: usize = 0;
    pub const SIZE_FIELD_LEN: usize = 8;
}

/// Undo-page header maintained by the page codec at the front of every page:
/// `insertion_point`, `first_chunk`, `continue_chunk`, `pd_lower`, `lsn`.
///
/// Modeled as plain free functions rather than a view struct that borrows
/// the page for its own lifetime: callers read/write one field at a time,
/// which keeps each borrow of the page scoped to a single statement instead
/// of living across a chain of field accesses.
pub const UNDO_PAGE_HEADER_SIZE: usize = 16;

pub mod page_header {
    use super::{Lsn, UNDO_PAGE_HEADER_SIZE};

    pub fn init(page: &mut [u8]) {
        page[0..UNDO_PAGE_HEADER_SIZE].fill(0);
        set_pd_lower(page, UNDO_PAGE_HEADER_SIZE as u16);
        set_insertion_point(page, UNDO_PAGE_HEADER_SIZE as u16);
    }

    pub fn insertion_point(page: &[u8]) -> u16 {
        u16::from_le_bytes(page[0..2].try_into().unwrap())
    }
    pub fn set_insertion_point(page: &mut [u8], v: u16) {
        page[0..2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn first_chunk(page: &[u8]) -> u16 {
        u16::from_le_bytes(page[2..4].try_into().unwrap())
    }
    pub fn set_first_chunk(page: &mut [u8], v: u16) {
        page[2..4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn continue_chunk(page: &[u8]) -> u16 {
        u16::from_le_bytes(page[4..6].try_into().unwrap())
    }
    pub fn set_continue_chunk(page: &mut [u8], v: u16) {
        page[4..6].copy_from_slice(&v.to_le_bytes());
    }

    pub fn pd_lower(page: &[u8]) -> u16 {
        u16::from_le_bytes(page[6..8].try_into().unwrap())
    }
    pub fn set_pd_lower(page: &mut [u8], v: u16) {
        page[6..8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn lsn(page: &[u8]) -> Lsn {
        u64::from_le_bytes(page[8..16].try_into().unwrap())
    }
    pub fn set_lsn(page: &mut [u8], v: Lsn) {
        page[8..16].copy_from_slice(&v.to_le_bytes());
    }

    /// Bumps `pd_lower` (and `insertion_point`) up to `new_insertion` if the
    /// page hasn't already recorded a later one.
    pub fn bump_insertion_point(page: &mut [u8], new_insertion: u16) {
        set_insertion_point(page, new_insertion);
        let cur = pd_lower(page);
        if new_insertion > cur {
            set_pd_lower(page, new_insertion);
        }
    }
}

pub fn usable_bytes_per_page() -> usize {
    BLCKSZ - UNDO_PAGE_HEADER_SIZE
}
