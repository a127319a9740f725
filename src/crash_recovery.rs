//! Finds and closes chunks left dangling by a crash: a record set whose
//! process died after appending records but before its chunk's `size`
//! field was ever patched in. WAL replay alone can't fix these up, since
//! there is no "close" WAL record to replay — the transaction never
//! issued one. Recovery locates a starting chunk header by scanning
//! backward from each log's tail for a page with a nonzero `first_chunk`,
//! then walks *forward* chunk by chunk (each step advancing by that
//! chunk's `size`) until it reaches either an open chunk (`size == 0`,
//! the dangling one) or the tail exactly (nothing dangling). A chunk
//! whose `size` would carry the walk past the tail is corruption, not a
//! dangling chunk, and is reported as an error rather than silently
//! skipped. The found chunk is closed exactly as `Closer` would, with one
//! difference: the close's WAL record is paired with an `XLOG_NOOP` filler
//! (see `config::XLOG_NOOP_DUMMY_SIZE`) since recovery has no relation
//! cache entry to attach real undo data to, and the record set's
//! `XactUndoSink` callback fires only once *both* overwrites of a
//! straddling `size` field have been applied — firing after just the
//! first half would let a second crash between the two overwrites leave
//! the field half-patched with the callback already run.

use crate::buffer_manager::BufferManager;
use crate::chunk_table::{ChunkTable, UrsHandle};
use crate::closer::Closer;
use crate::common::{UndoError, UndoResult};
use crate::config::XLOG_NOOP_DUMMY_SIZE;
use crate::log_alloc::UndoLogAllocator;
use crate::page_codec::{block_and_page_offset_to_usable_offset, read_chunk_header_at, read_type_header_at, usable_offset_to_block};
use crate::types::{page_header, ChunkHeader, UndoRecordSetType, Urp};
use crate::wal::{WalRecord, WalSink, XACT_CLOSE_MASK};
use crate::xact_undo::XactUndoSink;

pub struct CrashRecovery;

impl CrashRecovery {
    /// Scans every log the allocator knows about for a dangling chunk and
    /// closes each one found. Returns how many chunks were closed.
    pub fn close_dangling_chunks(
        buffers: &mut dyn BufferManager,
        allocator: &dyn UndoLogAllocator,
        wal: &mut dyn WalSink,
        xact_sink: &mut dyn XactUndoSink,
        lognos: impl Iterator<Item = u32>,
        next_handle: &mut UrsHandle,
    ) -> UndoResult<usize> {
        let mut closed = 0;
        for logno in lognos {
            let tail_usable = allocator.insertion_point(logno);
            if tail_usable == 0 {
                continue;
            }
            if Self::close_one(buffers, wal, xact_sink, logno, tail_usable, next_handle)? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    fn close_one(
        buffers: &mut dyn BufferManager,
        wal: &mut dyn WalSink,
        xact_sink: &mut dyn XactUndoSink,
        logno: u32,
        tail_usable: u64,
        next_handle: &mut UrsHandle,
    ) -> UndoResult<bool> {
        let tail_block = usable_offset_to_block(tail_usable - 1);
        let anchor = match Self::find_anchor(buffers, logno, tail_block)? {
            Some(a) => a,
            None => return Ok(false),
        };

        let (chunk_start, header) = match Self::walk_to_dangling_chunk(buffers, logno, anchor, tail_usable)? {
            Some(v) => v,
            None => return Ok(false), // chain reaches the tail already closed
        };

        let true_size = tail_usable - chunk_start.offset;
        let set_type = UndoRecordSetType::from_code(header.r#type);
        let type_header = read_type_header_at(buffers, chunk_start, set_type.type_header_size())?;

        let handle = *next_handle;
        *next_handle += 1;
        let mut table = ChunkTable::new();
        table.begin_chunk(handle, chunk_start, set_type, header.previous_chunk, 0);
        table.record_bytes(handle, true_size);

        let prepared = Closer::prepare_close(buffers, &table, handle, type_header)?
            .expect("just-registered chunk must be open in the scratch table");
        let bufs = prepared.commit();

        let rmgr_mask = if set_type == UndoRecordSetType::Transaction { XACT_CLOSE_MASK } else { 0 };
        let lsn = wal.append(&WalRecord::Undo {
            tnx_id: 0,
            rmgr_mask,
            bufs: bufs.clone(),
        })?;
        crate::wal::stamp_buffers_lsn(buffers, &bufs, lsn);
        wal.append(&WalRecord::Noop {
            dummy: vec![0u8; XLOG_NOOP_DUMMY_SIZE],
        })?;
        wal.flush()?;

        xact_sink.on_set_closed(0, handle);
        Ok(true)
    }

    /// Scans backward one block at a time from the tail for the nearest
    /// page recording a chunk header start (`first_chunk != 0`). This only
    /// bootstraps the forward walk with *some* header to start from; it
    /// does not by itself decide which chunk is dangling.
    fn find_anchor(buffers: &mut dyn BufferManager, logno: u32, tail_block: u64) -> UndoResult<Option<Urp>> {
        let mut block = tail_block;
        loop {
            let page = buffers.pin(logno, block)?;
            let first_chunk = page_header::first_chunk(&page.read().unwrap());
            if first_chunk != 0 {
                return Ok(Some(Urp::new(
                    logno,
                    block_and_page_offset_to_usable_offset(block, first_chunk as usize),
                )));
            }
            if block == 0 {
                return Ok(None);
            }
            block -= 1;
        }
    }

    /// Walks forward from `anchor`, advancing by each chunk's `size` field,
    /// until it reaches an open chunk (`size == 0`, the dangling one) or
    /// lands exactly on `tail_usable` (the chain's last chunk already
    /// closed before the crash, nothing dangling). A chunk whose `size`
    /// would carry the walk past `tail_usable` is corrupt bookkeeping, not
    /// a dangling chunk, and is reported rather than silently ignored.
    fn walk_to_dangling_chunk(
        buffers: &mut dyn BufferManager,
        logno: u32,
        anchor: Urp,
        tail_usable: u64,
    ) -> UndoResult<Option<(Urp, ChunkHeader)>> {
        let mut cursor = anchor;
        loop {
            let header = read_chunk_header_at(buffers, cursor)?;
            if header.size == 0 {
                return Ok(Some((cursor, header)));
            }
            let next_offset = cursor.offset + header.size;
            if next_offset > tail_usable {
                return Err(UndoError::ChunkSizeOverflow(format!(
                    "chunk at offset {} in log {} claims size {}, which runs past the insertion point {}",
                    cursor.offset, logno, header.size, tail_usable
                )));
            }
            if next_offset == tail_usable {
                return Ok(None);
            }
            cursor = Urp::new(logno, next_offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_manager::PagePool;
    use crate::log_alloc::FileUndoLogAllocator;
    use crate::planner::{InsertionPlanner, StepKind};
    use crate::types::{Persistence, CHUNK_HEADER_SIZE};
    use crate::wal::FileWal;
    use crate::xact_undo::RecordingXactUndoSink;
    use tempfile::tempdir;

    #[test]
    fn closes_a_chunk_left_open_by_a_simulated_crash() {
        let page_dir = tempdir().unwrap();
        let alloc_dir = tempdir().unwrap();
        let wal_dir = tempdir().unwrap();
        let mut pool = PagePool::new(page_dir.path(), 8).unwrap();
        let mut alloc = FileUndoLogAllocator::new(alloc_dir.path()).unwrap();
        let mut wal = FileWal::open(wal_dir.path().join("undo.wal")).unwrap();

        // Simulate a transaction that wrote a chunk header + one record
        // and then "crashed" (never closed it).
        let logno = alloc.attach(Persistence::Permanent).unwrap();
        let chunk_header_len = CHUNK_HEADER_SIZE + 8;
        let plan = InsertionPlanner::plan(&mut alloc, |a| a.attach(Persistence::Permanent), None, chunk_header_len, 16).unwrap();
        let header = ChunkHeader { size: 0, previous_chunk: Urp::INVALID, r#type: 0 };
        let mut combined = header.to_bytes().to_vec();
        combined.extend_from_slice(&[0u8; 8]);
        for step in &plan.steps {
            let page = match pool.max_block(logno) {
                Some(max) if step.block <= max => pool.pin(logno, step.block).unwrap(),
                _ => pool.new_page(logno, step.block).unwrap(),
            };
            let mut data = page.write().unwrap();
            match step.kind {
                StepKind::Header => {
                    data[step.page_off..step.page_off + step.len]
                        .copy_from_slice(&combined[step.in_off..step.in_off + step.len]);
                    if step.in_off == 0 {
                        page_header::set_first_chunk(&mut data, step.page_off as u16);
                    }
                }
                StepKind::Record => {
                    data[step.page_off..step.page_off + step.len].fill(0xAB);
                }
            }
        }

        let mut sink = RecordingXactUndoSink::default();
        let mut next_handle = 1u64;
        let closed = CrashRecovery::close_dangling_chunks(
            &mut pool,
            &alloc,
            &mut wal,
            &mut sink,
            std::iter::once(logno),
            &mut next_handle,
        )
        .unwrap();

        assert_eq!(closed, 1);
        assert_eq!(sink.calls.len(), 1);

        let header_page = pool.pin(logno, plan.steps[0].block).unwrap();
        let reread = ChunkHeader::from_bytes(&header_page.read().unwrap()[plan.steps[0].page_off..plan.steps[0].page_off + CHUNK_HEADER_SIZE]);
        assert_eq!(reread.size, chunk_header_len as u64 + 16);
    }
}
