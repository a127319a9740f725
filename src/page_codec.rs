//! Low-level, single-page primitives. Every operation here is bounded by
//! `BLCKSZ` and the page's `insertion_point`/`first_chunk`/`continue_chunk`
//! header fields, and returns `min(BLCKSZ - page_off, total - in_off)` — the
//! number of bytes it actually touched on this page. Higher layers
//! (`Writer`, `Closer`, `Replayer`) walk pages in a loop, feeding the
//! returned count back in as the next call's `in_off`.

use crate::buffer_manager::BufferManager;
use crate::common::UndoResult;
use crate::config::BLCKSZ;
use crate::types::{page_header, usable_bytes_per_page, ChunkHeader, Urp, CHUNK_HEADER_SIZE, UNDO_PAGE_HEADER_SIZE};

/// Usable-byte offset (skips per-page headers) -> block number within the log.
pub fn usable_offset_to_block(usable_offset: u64) -> u64 {
    usable_offset / usable_bytes_per_page() as u64
}

/// Usable-byte offset -> in-page byte offset (including the page header).
pub fn usable_offset_to_page_offset(usable_offset: u64) -> usize {
    UNDO_PAGE_HEADER_SIZE + (usable_offset % usable_bytes_per_page() as u64) as usize
}

/// Block number + in-page offset -> usable-byte offset, the inverse of the above.
pub fn block_and_page_offset_to_usable_offset(block: u64, page_offset: usize) -> u64 {
    block * usable_bytes_per_page() as u64 + (page_offset - UNDO_PAGE_HEADER_SIZE) as u64
}

fn bytes_on_this_page(page_off: usize, in_off: usize, total: usize) -> usize {
    std::cmp::min(BLCKSZ - page_off, total - in_off)
}

/// Reads `len` bytes starting at `page_off` on `block`, following onto the
/// next block when the run straddles a page boundary (the continuation
/// always starts right after that page's header, the convention
/// `PageCodec::insert_header` writes under). Shared by the chunk-header
/// reader below and by the type-header reader crash recovery uses to
/// rebuild a `CLOSE` entry's metadata when there is no live `Urs` to ask.
pub fn read_bytes_at(
    buffers: &mut dyn BufferManager,
    logno: u32,
    block: u64,
    page_off: usize,
    len: usize,
) -> UndoResult<Vec<u8>> {
    let available = BLCKSZ - page_off;
    if available >= len {
        let page = buffers.pin(logno, block)?;
        let data = page.read().unwrap();
        return Ok(data[page_off..page_off + len].to_vec());
    }
    let mut bytes = {
        let page = buffers.pin(logno, block)?;
        page.read().unwrap()[page_off..].to_vec()
    };
    let remaining = len - available;
    let next_page = buffers.pin(logno, block + 1)?;
    let next_data = next_page.read().unwrap();
    bytes.extend_from_slice(&next_data[UNDO_PAGE_HEADER_SIZE..UNDO_PAGE_HEADER_SIZE + remaining]);
    Ok(bytes)
}

/// Reads `CHUNK_HEADER_SIZE` bytes starting at `page_off` on `block`.
/// Shared by crash recovery's dangling-chunk scan and the closer's
/// chunk-chain walk for `CLOSE_MULTI_CHUNK`'s `first_chunk_header_location`.
pub fn read_chunk_header_bytes(
    buffers: &mut dyn BufferManager,
    logno: u32,
    block: u64,
    page_off: usize,
) -> UndoResult<Vec<u8>> {
    read_bytes_at(buffers, logno, block, page_off, CHUNK_HEADER_SIZE)
}

/// Reads the chunk header located at `urp`, resolving its block/page-offset
/// first.
pub fn read_chunk_header_at(buffers: &mut dyn BufferManager, urp: Urp) -> UndoResult<ChunkHeader> {
    let block = urp.block();
    let page_off = urp.page_offset();
    let bytes = read_chunk_header_bytes(buffers, urp.logno, block, page_off)?;
    Ok(ChunkHeader::from_bytes(&bytes))
}

/// Reads the `type_header_len`-byte type header that immediately follows
/// the fixed-size chunk header at `urp`. `Writer` lays a fresh copy of the
/// type header right after every chunk's own header (not just the set's
/// first), so this is recoverable without a live `Urs` even for a
/// continuation chunk.
pub fn read_type_header_at(buffers: &mut dyn BufferManager, urp: Urp, type_header_len: usize) -> UndoResult<Vec<u8>> {
    if type_header_len == 0 {
        return Ok(Vec::new());
    }
    let usable = urp.offset + CHUNK_HEADER_SIZE as u64;
    let block = usable_offset_to_block(usable);
    let page_off = usable_offset_to_page_offset(usable);
    read_bytes_at(buffers, urp.logno, block, page_off, type_header_len)
}

pub struct PageCodec;

impl PageCodec {
    /// Zeroes a freshly pinned page and lays in the page-header stub.
    pub fn init_page(page: &mut [u8]) {
        debug_assert_eq!(page.len(), BLCKSZ);
        page.fill(0);
        page_header::init(page);
    }

    /// Writes the portion of `(chunk_header || type_header)` that fits on
    /// this page starting at `page_off`, continuing from `in_off` bytes
    /// already written on a previous page. Updates `first_chunk` (this page
    /// offset) when the header starts here, or `continue_chunk` (the number
    /// of header bytes already written elsewhere) when it is a continuation
    /// of a header that started on an earlier page. Crash recovery uses
    /// these two fields together to locate a chunk's header without
    /// replaying the whole log.
    pub fn insert_header(
        page: &mut [u8],
        page_off: usize,
        in_off: usize,
        chunk_header: &[u8],
        type_header: Option<&[u8]>,
        chunk_start: Urp,
    ) -> usize {
        let type_header_len = type_header.map_or(0, |t| t.len());
        let total = chunk_header.len() + type_header_len;
        let n = bytes_on_this_page(page_off, in_off, total);

        let mut written = 0usize;
        let mut dst = page_off;
        let mut src = in_off;
        while written < n {
            let byte = if src < chunk_header.len() {
                chunk_header[src]
            } else {
                type_header.unwrap()[src - chunk_header.len()]
            };
            page[dst] = byte;
            dst += 1;
            src += 1;
            written += 1;
        }

        if in_off == 0 {
            page_header::set_first_chunk(page, page_off as u16);
        } else {
            page_header::set_continue_chunk(page, in_off as u16);
        }
        let _ = chunk_start; // recorded by the caller's ChunkTable, not re-derived here
        let new_insertion = (page_off + n) as u16;
        page_header::bump_insertion_point(page, new_insertion);
        n
    }

    /// Writes the portion of `record` that fits on this page. `chunk_start`/
    /// `type` are accepted to match the spec's signature (a caller building a
    /// WAL `ADD_PAGE` entry needs them) but this primitive itself only
    /// updates `insertion_point`/`pd_lower` — record continuation does not
    /// move `first_chunk`/`continue_chunk`, which track header locations only.
    pub fn insert_record(
        page: &mut [u8],
        page_off: usize,
        in_off: usize,
        record: &[u8],
        chunk_start: Urp,
        r#type: u8,
    ) -> usize {
        let n = bytes_on_this_page(page_off, in_off, record.len());
        page[page_off..page_off + n].copy_from_slice(&record[in_off..in_off + n]);
        let _ = (chunk_start, r#type);

        let new_insertion = (page_off + n) as u16;
        page_header::bump_insertion_point(page, new_insertion);
        n
    }

    /// Patches `size` bytes at `page_off`, used to close a chunk's `size`
    /// field. May be called twice in sequence when the field straddles two
    /// pages: the caller tracks `in_off` across both calls.
    pub fn overwrite(page: &mut [u8], page_off: usize, in_off: usize, size: usize, src: &[u8]) -> usize {
        let n = bytes_on_this_page(page_off, in_off, size);
        page[page_off..page_off + n].copy_from_slice(&src[in_off..in_off + n]);
        n
    }

    /// REDO-time equivalent of `insert_header` for a block that wasn't
    /// registered (FPI-restored or discarded): advances offsets without
    /// touching page bytes.
    pub fn skip_header(page_off: usize, in_off: usize, total: usize) -> usize {
        bytes_on_this_page(page_off, in_off, total)
    }

    pub fn skip_record(page_off: usize, in_off: usize, total: usize) -> usize {
        bytes_on_this_page(page_off, in_off, total)
    }

    pub fn skip_overwrite(page_off: usize, in_off: usize, total: usize) -> usize {
        bytes_on_this_page(page_off, in_off, total)
    }
}
