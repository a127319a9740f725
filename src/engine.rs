//! `UndoEngine`: the process-wide context one backend holds, bundling the
//! buffer manager, log allocator, WAL sink, and transaction-close sink
//! behind the public surface every caller actually uses — create a set,
//! prepare/commit an insert, prepare/commit a close, release or destroy a
//! set, replay a WAL record, and close whatever chunks a crash left open.
//! Grounded in the teacher's top-level database-context bootstrap (its
//! `lib.rs`/`init.rs`, owning storage/WAL singletons directly) rather
//! than reaching for process-global state.

use crate::buffer_manager::{BufferManager, PagePool};
use crate::chunk_table::{ChunkTable, UrsHandle};
use crate::closer::Closer;
use crate::common::UndoResult;
use crate::config::DEFAULT_BUFFER_POOL_PAGES;
use crate::crash_recovery::CrashRecovery;
use crate::log_alloc::{FileUndoLogAllocator, UndoLogAllocator};
use crate::types::{Persistence, UndoRecordSetType, Urp, URST_TRANSACTION_CODE};
use crate::urs::Urs;
use crate::wal::{DecodedWalRecord, FileWal, WalRecord, WalSink, XACT_CLOSE_MASK};
use crate::writer::{PreparedInsert, Writer};
use crate::xact_undo::XactUndoSink;
use std::path::Path;

pub use crate::closer::PreparedClose;

/// One backend's view of the undo subsystem. Not `Sync`; the spec's
/// concurrency model is one `UndoEngine` per backend thread, each with its
/// own buffer/allocator/WAL handles over the same backing directory.
pub struct UndoEngine {
    buffers: Box<dyn BufferManager>,
    allocator: Box<dyn UndoLogAllocator>,
    wal: Box<dyn WalSink>,
    xact_sink: Box<dyn XactUndoSink>,
    chunk_table: ChunkTable,
    sets: std::collections::HashMap<UrsHandle, Urs>,
    next_handle: UrsHandle,
}

impl UndoEngine {
    pub fn new(
        buffers: Box<dyn BufferManager>,
        allocator: Box<dyn UndoLogAllocator>,
        wal: Box<dyn WalSink>,
        xact_sink: Box<dyn XactUndoSink>,
    ) -> Self {
        UndoEngine {
            buffers,
            allocator,
            wal,
            xact_sink,
            chunk_table: ChunkTable::new(),
            sets: std::collections::HashMap::new(),
            next_handle: 1,
        }
    }

    /// Convenience constructor wiring the file-backed implementations of
    /// every collaborator under one base directory.
    pub fn open(base_dir: impl AsRef<Path>, xact_sink: Box<dyn XactUndoSink>) -> UndoResult<Self> {
        let base = base_dir.as_ref();
        let buffers = Box::new(PagePool::new(base.join("pages"), DEFAULT_BUFFER_POOL_PAGES)?);
        let allocator = Box::new(FileUndoLogAllocator::new(base.join("logs"))?);
        let wal = Box::new(FileWal::open(base.join("undo.wal"))?);
        Ok(Self::new(buffers, allocator, wal, xact_sink))
    }

    pub fn create(
        &mut self,
        r#type: UndoRecordSetType,
        persistence: Persistence,
        nesting_level: u32,
    ) -> UrsHandle {
        self.create_with_header(r#type, persistence, nesting_level, vec![0u8; r#type.type_header_size()])
    }

    pub fn create_with_header(
        &mut self,
        r#type: UndoRecordSetType,
        persistence: Persistence,
        nesting_level: u32,
        type_header: Vec<u8>,
    ) -> UrsHandle {
        assert_eq!(
            type_header.len(),
            r#type.type_header_size(),
            "type_header length must match the record-set type's fixed size"
        );
        let handle = self.next_handle;
        self.next_handle += 1;
        let urs = Urs::new(handle, r#type, persistence, nesting_level, type_header, Urp::INVALID);
        self.sets.insert(handle, urs);
        handle
    }

    pub fn prepare_insert(&mut self, handle: UrsHandle, record_size: u64) -> UndoResult<PreparedInsert> {
        let urs = self.sets.get(&handle).expect("prepare_insert on an unknown handle");
        assert!(urs.can_insert(), "prepare_insert on a closed set {}", handle);
        Writer::prepare_insert(
            self.buffers.as_mut(),
            self.allocator.as_mut(),
            &self.chunk_table,
            handle,
            urs,
            record_size,
        )
    }

    /// Commit half of an insert: writes the prepared bytes into the pages
    /// `prepare_insert` pinned, appends the resulting WAL record, and
    /// marks the set `Dirty` the first time this succeeds (the insert that
    /// opened its chunk).
    pub fn commit_insert(&mut self, prepared: PreparedInsert, record: &[u8]) -> UndoResult<Urp> {
        let handle = prepared.handle();
        let was_new_chunk = prepared.is_new_chunk();
        let (urp, bufs) = prepared.commit(&mut self.chunk_table, record);
        let lsn = self.wal.append(&WalRecord::Undo {
            tnx_id: 0,
            rmgr_mask: 0,
            bufs: bufs.clone(),
        })?;
        crate::wal::stamp_buffers_lsn(self.buffers.as_mut(), &bufs, lsn);
        if was_new_chunk {
            if let Some(urs) = self.sets.get_mut(&handle) {
                urs.mark_dirty();
            }
        }
        Ok(urp)
    }

    pub fn prepare_close(&mut self, handle: UrsHandle) -> UndoResult<Option<PreparedClose>> {
        let type_header = self.sets.get(&handle).map(|u| u.type_header.clone()).unwrap_or_default();
        Closer::prepare_close(self.buffers.as_mut(), &self.chunk_table, handle, type_header)
    }

    pub fn commit_close(&mut self, prepared: PreparedClose) -> UndoResult<()> {
        let handle = prepared.handle();
        let bufs = prepared.commit();
        // The whole set closes with its chunk, so REDO must fire the
        // xact-undo callback whenever this is a `Transaction` set.
        let rmgr_mask = if bufs.iter().any(|b| b.urs_type == URST_TRANSACTION_CODE) {
            XACT_CLOSE_MASK
        } else {
            0
        };
        let lsn = self.wal.append(&WalRecord::Undo {
            tnx_id: 0,
            rmgr_mask,
            bufs: bufs.clone(),
        })?;
        crate::wal::stamp_buffers_lsn(self.buffers.as_mut(), &bufs, lsn);
        let closed_chunk = self.chunk_table.take_closed(handle);
        if let Some(urs) = self.sets.get_mut(&handle) {
            urs.mark_closed();
            if let Some(chunk) = closed_chunk {
                // A future chunk for this same set (if the caller creates
                // one) chains back to the one that just closed.
                urs.chunk_start = chunk.start;
            }
        }
        self.xact_sink.on_set_closed(0, handle);
        Ok(())
    }

    /// Forgets a set without requiring it be closed: used for `Unlogged`/
    /// `Temp` sets a backend simply stops caring about.
    pub fn release(&mut self, handle: UrsHandle) {
        self.sets.remove(&handle);
    }

    /// Forgets a set and asserts it was never left `Dirty` — destroying a
    /// set with an unflushed chunk header loses data silently, which is a
    /// programmer error rather than a recoverable one.
    pub fn destroy(&mut self, handle: UrsHandle) {
        if let Some(urs) = self.sets.get(&handle) {
            assert_ne!(urs.state(), crate::urs::UrsState::Dirty, "destroy called on a Dirty set {}", handle);
        }
        self.sets.remove(&handle);
        self.chunk_table.take_closed(handle);
    }

    pub fn replay(&mut self, record: &DecodedWalRecord) -> UndoResult<()> {
        crate::replayer::Replayer::replay(self.buffers.as_mut(), self.xact_sink.as_mut(), record)
    }

    /// Run once at startup, after WAL replay has brought every page up to
    /// date: finds any chunk a crash left without a closing `size` patch
    /// and closes it, firing `XactUndoSink` for each.
    pub fn close_dangling_sets(&mut self) -> UndoResult<usize> {
        let lognos = self.allocator.known_lognos();
        CrashRecovery::close_dangling_chunks(
            self.buffers.as_mut(),
            self.allocator.as_ref(),
            self.wal.as_mut(),
            self.xact_sink.as_mut(),
            lognos.into_iter(),
            &mut self.next_handle,
        )
    }

    pub fn flush(&mut self) -> UndoResult<()> {
        self.wal.flush()?;
        self.buffers.flush()
    }
}
