//! Patches a chunk's `size` field from 0 to its final value once the set
//! that owns it is done appending, and — since every close in this engine
//! finishes off the whole record set rather than just one chunk of it —
//! stages the set's close metadata (`urs_type` + verbatim `type_header`)
//! on the same buf-data entry. The field can straddle two pages when the
//! chunk header happened to land near a page boundary; `prepare_close`
//! pins whichever one or two pages hold it, and `PreparedClose::commit`
//! writes both halves in one non-fallible step, same Prepare/Commit split
//! as `Writer`. Only one `UndoBufData` entry is ever produced for the
//! patch, even when it straddles pages: REDO re-splits the 8-byte `size`
//! field across pages itself rather than needing one entry per page
//! touched.

use crate::buffer_manager::{BufferManager, PageHandle};
use crate::chunk_table::{ChunkTable, OpenChunk, UrsHandle};
use crate::common::UndoResult;
use crate::page_codec::{read_chunk_header_at, PageCodec};
use crate::planner::split_usable_range;
use crate::types::{ChunkHeader, Urp};
use crate::wal::{UndoBufData, UndoBufFlags};

pub struct PreparedClose {
    handle: UrsHandle,
    chunk: OpenChunk,
    overwrite_steps: Vec<(u64, usize, usize, usize)>,
    pages: Vec<(u64, PageHandle)>,
    type_header: Vec<u8>,
    first_chunk_header_location: Option<Urp>,
}

impl PreparedClose {
    pub fn final_size(&self) -> u64 {
        self.chunk.size
    }

    /// Critical section: patches the `size` bytes into the pinned page(s)
    /// and hands back the single `UndoBufData` entry for the WAL record.
    /// The caller is responsible for removing the set's chunk from
    /// `ChunkTable` (`take_closed`) once this returns.
    pub fn commit(self) -> Vec<UndoBufData> {
        let size_bytes = self.chunk.size.to_le_bytes();
        for (block, page_off, in_off, len) in &self.overwrite_steps {
            let (_, handle) = self.pages.iter().find(|(b, _)| b == block).expect("block must be pinned");
            let mut page = handle.write().unwrap();
            PageCodec::overwrite(&mut page, *page_off, *in_off, size_bytes.len(), &size_bytes);
            let _ = len;
        }

        let (first_block, first_page_off, _, _) = self.overwrite_steps[0];
        let is_multi = self.chunk.previous_chunk.is_valid();
        let mut buf = UndoBufData::new(
            (if is_multi { UndoBufFlags::CLOSE_MULTI_CHUNK } else { UndoBufFlags::CLOSE_CHUNK }) | UndoBufFlags::CLOSE,
            self.chunk.start.logno,
            first_block,
            first_page_off as u16,
            0,
            size_bytes.to_vec(),
        );
        buf.urs_type = self.chunk.r#type.code();
        buf.type_header = self.type_header;
        buf.first_chunk_header_location = self.first_chunk_header_location;
        vec![buf]
    }

    pub fn handle(&self) -> UrsHandle {
        self.handle
    }
}

pub struct Closer;

impl Closer {
    pub fn prepare_close(
        buffers: &mut dyn BufferManager,
        chunk_table: &ChunkTable,
        handle: UrsHandle,
        type_header: Vec<u8>,
    ) -> UndoResult<Option<PreparedClose>> {
        let chunk = match chunk_table.current(handle) {
            Some(c) => c.clone(),
            None => return Ok(None),
        };

        let overwrite_steps = split_usable_range(chunk.start.offset + ChunkHeader::SIZE_FIELD_OFFSET as u64, ChunkHeader::SIZE_FIELD_LEN as u64);
        let mut pages = Vec::new();
        for (block, _, _, _) in &overwrite_steps {
            let page = buffers.pin(chunk.start.logno, *block)?;
            pages.push((*block, page));
        }

        let first_chunk_header_location = if chunk.previous_chunk.is_valid() {
            Some(Self::walk_to_first_chunk(buffers, chunk.previous_chunk)?)
        } else {
            None
        };

        Ok(Some(PreparedClose {
            handle,
            chunk,
            overwrite_steps,
            pages,
            type_header,
            first_chunk_header_location,
        }))
    }

    /// Walks backward through `previous_chunk` pointers from `cursor` until
    /// it finds the chunk whose own `previous_chunk` is invalid: that
    /// chunk's header is the set's very first one.
    fn walk_to_first_chunk(buffers: &mut dyn BufferManager, mut cursor: Urp) -> UndoResult<Urp> {
        loop {
            let header = read_chunk_header_at(buffers, cursor)?;
            if !header.previous_chunk.is_valid() {
                return Ok(cursor);
            }
            cursor = header.previous_chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_manager::PagePool;
    use crate::types::{Urp, UndoRecordSetType};
    use tempfile::tempdir;

    #[test]
    fn close_patches_size_field_in_place() {
        let dir = tempdir().unwrap();
        let mut pool = PagePool::new(dir.path(), 4).unwrap();
        pool.new_page(0, 0).unwrap();

        let mut table = ChunkTable::new();
        table.begin_chunk(1, Urp::new(0, 16), UndoRecordSetType::Transaction, Urp::INVALID, 32);
        table.record_bytes(1, 64);

        let prepared = Closer::prepare_close(&mut pool, &table, 1, vec![0u8; 8]).unwrap().unwrap();
        assert_eq!(prepared.final_size(), 96);
        let bufs = prepared.commit();
        assert_eq!(bufs.len(), 1);
        assert!(bufs[0].flag.contains(UndoBufFlags::CLOSE_CHUNK));
        assert!(bufs[0].flag.contains(UndoBufFlags::CLOSE));
        assert!(!bufs[0].flag.contains(UndoBufFlags::CLOSE_MULTI_CHUNK));

        let page = pool.pin(0, 0).unwrap();
        let page_off = crate::page_codec::usable_offset_to_page_offset(16);
        let read_back = u64::from_le_bytes(page.read().unwrap()[page_off..page_off + 8].try_into().unwrap());
        assert_eq!(read_back, 96);
    }

    #[test]
    fn closing_a_second_chunk_reports_multi_chunk_and_finds_the_first_header() {
        use crate::types::ChunkHeader;

        let dir = tempdir().unwrap();
        let mut pool = PagePool::new(dir.path(), 4).unwrap();
        pool.new_page(0, 0).unwrap();

        let first_chunk_urp = Urp::new(0, 0);
        let first_header = ChunkHeader { size: 40, previous_chunk: Urp::INVALID, r#type: 0 };
        {
            let page = pool.pin(0, 0).unwrap();
            let page_off = crate::page_codec::usable_offset_to_page_offset(0);
            page.write().unwrap()[page_off..page_off + crate::types::CHUNK_HEADER_SIZE]
                .copy_from_slice(&first_header.to_bytes());
        }

        let mut table = ChunkTable::new();
        table.begin_chunk(2, Urp::new(0, 56), UndoRecordSetType::Transaction, first_chunk_urp, 16);
        table.record_bytes(2, 24);

        let prepared = Closer::prepare_close(&mut pool, &table, 2, vec![0u8; 8]).unwrap().unwrap();
        let bufs = prepared.commit();
        assert_eq!(bufs.len(), 1);
        assert!(bufs[0].flag.contains(UndoBufFlags::CLOSE_MULTI_CHUNK));
        assert!(!bufs[0].flag.contains(UndoBufFlags::CLOSE_CHUNK));
        assert_eq!(bufs[0].first_chunk_header_location.unwrap().offset, first_chunk_urp.offset);
    }
}
