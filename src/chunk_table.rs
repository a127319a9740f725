//! Tracks the currently-open chunk of every live record set: where it
//! started, how many bytes have gone into it so far, and the previous
//! chunk's pointer for the backward chain discard/crash-recovery walk.
//! Grounded in the teacher's `storage::table::Table`, which keeps an
//! in-memory index of live allocations rather than re-deriving them by
//! re-reading pages on every call.

use crate::types::{Urp, UndoRecordSetType};
use std::collections::HashMap;

pub type UrsHandle = u64;

#[derive(Clone, Debug)]
pub struct OpenChunk {
    pub start: Urp,
    pub r#type: UndoRecordSetType,
    pub previous_chunk: Urp,
    /// Bytes written so far, header included; this is the value that gets
    /// patched into the on-disk `size` field when the chunk closes.
    pub size: u64,
}

#[derive(Default)]
pub struct ChunkTable {
    open: HashMap<UrsHandle, OpenChunk>,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self { open: HashMap::new() }
    }

    pub fn begin_chunk(
        &mut self,
        handle: UrsHandle,
        start: Urp,
        r#type: UndoRecordSetType,
        previous_chunk: Urp,
        header_len: u64,
    ) {
        self.open.insert(
            handle,
            OpenChunk {
                start,
                r#type,
                previous_chunk,
                size: header_len,
            },
        );
    }

    pub fn record_bytes(&mut self, handle: UrsHandle, nbytes: u64) {
        if let Some(chunk) = self.open.get_mut(&handle) {
            chunk.size += nbytes;
        }
    }

    pub fn current(&self, handle: UrsHandle) -> Option<&OpenChunk> {
        self.open.get(&handle)
    }

    /// Removes and returns the chunk's final bookkeeping so the caller can
    /// patch its on-disk `size` field and persist a new `previous_chunk`
    /// pointer for whatever chunk comes next.
    pub fn take_closed(&mut self, handle: UrsHandle) -> Option<OpenChunk> {
        self.open.remove(&handle)
    }

    pub fn is_open(&self, handle: UrsHandle) -> bool {
        self.open.contains_key(&handle)
    }

    pub fn open_handles(&self) -> impl Iterator<Item = UrsHandle> + '_ {
        self.open.keys().copied()
    }
}
