//! Applies a decoded WAL record to pages during REDO (recovery after a
//! crash, or a standby replaying a primary's stream). The spec's central
//! invariant is REDO=DO: this must reproduce exactly the bytes and header
//! field updates the original `Writer`/`Closer` call made, so `replay_buf`
//! intentionally mirrors `PageCodec::insert_header`/`insert_record` rather
//! than calling them, since REDO needs the buffer's *recorded* `in_off`
//! (from the WAL) and not one re-derived from a live `InsertionPlan`.
//! Idempotent via the page's stamped LSN, so replaying the same record
//! twice (always possible after a crash mid-checkpoint) is harmless. A
//! `CLOSE`-flagged buffer additionally fires the transaction-close
//! callback (`XactUndoSink`) once the patch it carries has actually been
//! (re)applied, since a close here ends the whole record set rather than
//! just one chunk of it.

use crate::buffer_manager::BufferManager;
use crate::common::{UndoError, UndoResult};
use crate::planner::split_usable_range;
use crate::types::{page_header, Lsn, URST_TRANSACTION_CODE};
use crate::wal::{DecodedWalRecord, UndoBufData, UndoBufFlags, WalRecord, XACT_CLOSE_MASK};
use crate::xact_undo::XactUndoSink;

pub struct Replayer;

impl Replayer {
    pub fn replay(
        buffers: &mut dyn BufferManager,
        xact_sink: &mut dyn XactUndoSink,
        decoded: &DecodedWalRecord,
    ) -> UndoResult<()> {
        match &decoded.record {
            WalRecord::Undo { tnx_id, rmgr_mask, bufs } => {
                for buf in bufs {
                    Self::replay_buf(buffers, decoded.lsn, *tnx_id, *rmgr_mask, xact_sink, buf)?;
                }
            }
            WalRecord::Noop { .. } => {}
        }
        Ok(())
    }

    fn replay_buf(
        buffers: &mut dyn BufferManager,
        lsn: Lsn,
        tnx_id: u64,
        rmgr_mask: u16,
        xact_sink: &mut dyn XactUndoSink,
        buf: &UndoBufData,
    ) -> UndoResult<()> {
        let is_close = buf.flag.contains(UndoBufFlags::CLOSE_CHUNK) || buf.flag.contains(UndoBufFlags::CLOSE_MULTI_CHUNK);
        let applied = if is_close {
            Self::replay_close(buffers, lsn, buf)?
        } else {
            Self::replay_single_page(buffers, lsn, buf)?
        };

        if applied && buf.flag.contains(UndoBufFlags::CLOSE) {
            let says_transaction = buf.urs_type == URST_TRANSACTION_CODE;
            let rmgr_says_transaction = rmgr_mask & XACT_CLOSE_MASK != 0;
            if says_transaction != rmgr_says_transaction {
                return Err(UndoError::UnexpectedXactOp(format!(
                    "buf urs_type {} disagrees with rmgr_mask {:#06x} on transaction close",
                    buf.urs_type, rmgr_mask
                )));
            }
            if says_transaction {
                let handle = (buf.logno as u64) << 32 | buf.block;
                xact_sink.on_set_closed(tnx_id, handle);
            }
        }
        Ok(())
    }

    /// `CREATE`/`ADD_CHUNK`/`INSERT`/`ADD_PAGE`: always exactly one page.
    fn replay_single_page(buffers: &mut dyn BufferManager, lsn: Lsn, buf: &UndoBufData) -> UndoResult<bool> {
        let handle = match Self::page_for(buffers, buf.flag, buf.logno, buf.block)? {
            Some(h) => h,
            None => return Ok(false),
        };

        let mut page = handle.write().unwrap();
        if page_header::lsn(&page) >= lsn {
            return Ok(false); // already applied
        }

        let page_off = buf.page_offset as usize;
        page[page_off..page_off + buf.payload.len()].copy_from_slice(&buf.payload);
        if buf.flag.contains(UndoBufFlags::CREATE) || buf.flag.contains(UndoBufFlags::ADD_CHUNK) {
            if buf.in_off == 0 {
                page_header::set_first_chunk(&mut page, page_off as u16);
            } else {
                page_header::set_continue_chunk(&mut page, buf.in_off as u16);
            }
        }
        let new_insertion = (page_off + buf.payload.len()) as u16;
        page_header::bump_insertion_point(&mut page, new_insertion);
        page_header::set_lsn(&mut page, lsn);
        Ok(true)
    }

    /// `CLOSE_CHUNK`/`CLOSE_MULTI_CHUNK`: `buf.payload` is the whole `size`
    /// field logged from a single page's worth of view during DO; REDO
    /// re-splits it across however many pages it actually spans the same
    /// way `Closer` did, and stamps/checks each page's LSN independently so
    /// a crash between the two halves can't leave one half re-applied and
    /// the other skipped.
    fn replay_close(buffers: &mut dyn BufferManager, lsn: Lsn, buf: &UndoBufData) -> UndoResult<bool> {
        let usable = crate::page_codec::block_and_page_offset_to_usable_offset(buf.block, buf.page_offset as usize);
        let steps = split_usable_range(usable, buf.payload.len() as u64);
        let mut applied = false;
        for (block, page_off, in_off, len) in steps {
            let handle = match buffers.max_block(buf.logno) {
                Some(max) if block <= max => buffers.pin(buf.logno, block)?,
                _ => continue,
            };
            let mut page = handle.write().unwrap();
            if page_header::lsn(&page) >= lsn {
                continue;
            }
            page[page_off..page_off + len].copy_from_slice(&buf.payload[in_off..in_off + len]);
            page_header::set_lsn(&mut page, lsn);
            applied = true;
        }
        Ok(applied)
    }

    fn page_for(
        buffers: &mut dyn BufferManager,
        flag: UndoBufFlags,
        logno: u32,
        block: u64,
    ) -> UndoResult<Option<crate::buffer_manager::PageHandle>> {
        if flag.contains(UndoBufFlags::CREATE) {
            return Ok(Some(buffers.new_page(logno, block)?));
        }
        match buffers.max_block(logno) {
            Some(max) if block <= max => Ok(Some(buffers.pin(logno, block)?)),
            // Block was never registered with this replica (e.g. FPI
            // restored a later page and this one was skipped): nothing to
            // apply, REDO just advances past it.
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_manager::PagePool;
    use crate::types::UNDO_PAGE_HEADER_SIZE;
    use crate::xact_undo::RecordingXactUndoSink;
    use tempfile::tempdir;

    #[test]
    fn replay_insert_writes_payload_and_stamps_lsn() {
        let dir = tempdir().unwrap();
        let mut pool = PagePool::new(dir.path(), 4).unwrap();
        let mut sink = RecordingXactUndoSink::default();
        let record = DecodedWalRecord {
            lsn: 1000,
            record: WalRecord::Undo {
                tnx_id: 1,
                rmgr_mask: 0,
                bufs: vec![UndoBufData::new(UndoBufFlags::CREATE, 0, 0, UNDO_PAGE_HEADER_SIZE as u16, 0, vec![7; 24])],
            },
        };
        Replayer::replay(&mut pool, &mut sink, &record).unwrap();
        let page = pool.pin(0, 0).unwrap();
        let data = page.read().unwrap();
        assert_eq!(&data[UNDO_PAGE_HEADER_SIZE..UNDO_PAGE_HEADER_SIZE + 24], &[7u8; 24][..]);
        assert_eq!(page_header::first_chunk(&data), UNDO_PAGE_HEADER_SIZE as u16);
        assert_eq!(page_header::lsn(&data), 1000);
    }

    #[test]
    fn replay_is_idempotent_once_lsn_matches() {
        let dir = tempdir().unwrap();
        let mut pool = PagePool::new(dir.path(), 4).unwrap();
        let mut sink = RecordingXactUndoSink::default();
        let record = DecodedWalRecord {
            lsn: 5,
            record: WalRecord::Undo {
                tnx_id: 1,
                rmgr_mask: 0,
                bufs: vec![UndoBufData::new(UndoBufFlags::CREATE, 0, 0, UNDO_PAGE_HEADER_SIZE as u16, 0, vec![1, 2, 3])],
            },
        };
        Replayer::replay(&mut pool, &mut sink, &record).unwrap();
        // Mutate the page directly, then replay the same record again: a
        // second apply must be a no-op since the page's LSN already covers it.
        {
            let page = pool.pin(0, 0).unwrap();
            page.write().unwrap()[UNDO_PAGE_HEADER_SIZE] = 0xEE;
        }
        Replayer::replay(&mut pool, &mut sink, &record).unwrap();
        let page = pool.pin(0, 0).unwrap();
        assert_eq!(page.read().unwrap()[UNDO_PAGE_HEADER_SIZE], 0xEE);
    }

    #[test]
    fn replay_of_transaction_close_fires_xact_sink() {
        let dir = tempdir().unwrap();
        let mut pool = PagePool::new(dir.path(), 4).unwrap();
        pool.new_page(0, 0).unwrap();
        let mut sink = RecordingXactUndoSink::default();

        let mut buf = UndoBufData::new(
            UndoBufFlags::CLOSE_CHUNK | UndoBufFlags::CLOSE,
            0,
            0,
            UNDO_PAGE_HEADER_SIZE as u16,
            0,
            96u64.to_le_bytes().to_vec(),
        );
        buf.urs_type = URST_TRANSACTION_CODE;
        let record = DecodedWalRecord {
            lsn: 10,
            record: WalRecord::Undo { tnx_id: 7, rmgr_mask: XACT_CLOSE_MASK, bufs: vec![buf] },
        };

        Replayer::replay(&mut pool, &mut sink, &record).unwrap();
        assert_eq!(sink.calls.len(), 1);
        assert_eq!(sink.calls[0].0, 7);

        let page = pool.pin(0, 0).unwrap();
        let page_off = UNDO_PAGE_HEADER_SIZE;
        let got = u64::from_le_bytes(page.read().unwrap()[page_off..page_off + 8].try_into().unwrap());
        assert_eq!(got, 96);
    }

    #[test]
    fn replay_of_close_with_mismatched_rmgr_errors() {
        let dir = tempdir().unwrap();
        let mut pool = PagePool::new(dir.path(), 4).unwrap();
        pool.new_page(0, 0).unwrap();
        let mut sink = RecordingXactUndoSink::default();

        let mut buf = UndoBufData::new(
            UndoBufFlags::CLOSE_CHUNK | UndoBufFlags::CLOSE,
            0,
            0,
            UNDO_PAGE_HEADER_SIZE as u16,
            0,
            96u64.to_le_bytes().to_vec(),
        );
        buf.urs_type = URST_TRANSACTION_CODE;
        let record = DecodedWalRecord {
            lsn: 10,
            record: WalRecord::Undo { tnx_id: 7, rmgr_mask: 0, bufs: vec![buf] },
        };

        let err = Replayer::replay(&mut pool, &mut sink, &record).unwrap_err();
        assert!(matches!(err, UndoError::UnexpectedXactOp(_)));
    }
}
