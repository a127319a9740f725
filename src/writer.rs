//! Turns an `InsertionPlan` into actual page writes. Split into `prepare`
//! (pins every page the plan touches, allocates nothing it didn't already
//! reserve through the planner) and `PreparedInsert::commit` (copies bytes
//! into already-pinned pages and can't fail), mirroring the spec's
//! Prepare/Commit split for `Writer`: the fallible, allocating half runs
//! ahead of time so the half that runs inside a caller's critical section
//! is infallible.

use crate::buffer_manager::{BufferManager, PageHandle};
use crate::chunk_table::{ChunkTable, UrsHandle};
use crate::common::UndoResult;
use crate::log_alloc::UndoLogAllocator;
use crate::page_codec::PageCodec;
use crate::planner::{InsertionPlan, InsertionPlanner, StepKind};
use crate::types::{ChunkHeader, Persistence, UndoRecordSetType, Urp, CHUNK_HEADER_SIZE};
use crate::urs::Urs;
use crate::wal::{UndoBufData, UndoBufFlags};
use std::collections::HashSet;

pub struct PreparedInsert {
    handle: UrsHandle,
    plan: InsertionPlan,
    pages: Vec<(u64, PageHandle)>,
    chunk_header_bytes: Option<Vec<u8>>,
    r#type_header: Vec<u8>,
    set_type: UndoRecordSetType,
    previous_chunk: Urp,
}

impl PreparedInsert {
    pub fn record_urp(&self) -> Urp {
        self.plan.record_urp
    }

    pub fn is_new_chunk(&self) -> bool {
        self.plan.new_chunk_start.is_some()
    }

    pub fn handle(&self) -> UrsHandle {
        self.handle
    }

    fn page_for(&self, block: u64) -> &PageHandle {
        &self.pages.iter().find(|(b, _)| *b == block).expect("block must be pinned by prepare").1
    }

    /// Critical section: writes `record` (and, for a new chunk, the header
    /// bytes computed in `prepare`) into the pages `prepare` already
    /// pinned. Returns the record's `Urp` and the `UndoBufData` entries the
    /// caller folds into a single `WalRecord::Undo`.
    pub fn commit(self, chunk_table: &mut ChunkTable, record: &[u8]) -> (Urp, Vec<UndoBufData>) {
        let mut bufs = Vec::new();
        // A chunk is this set's first iff nothing closed before it; later
        // chunks always carry a valid `previous_chunk` pointer back to the
        // one that closed to make room for them.
        let is_first_chunk = !self.previous_chunk.is_valid();
        let combined_header: Vec<u8> = match &self.chunk_header_bytes {
            Some(h) => {
                let mut v = h.clone();
                v.extend(&self.r#type_header);
                v
            }
            None => Vec::new(),
        };

        for step in &self.plan.steps {
            let mut page = self.page_for(step.block).write().unwrap();
            match step.kind {
                StepKind::Header => {
                    let chunk_start = self.plan.new_chunk_start.unwrap();
                    PageCodec::insert_header(
                        &mut page,
                        step.page_off,
                        step.in_off,
                        &combined_header[..combined_header.len().min(CHUNK_HEADER_SIZE)],
                        Some(&combined_header[CHUNK_HEADER_SIZE.min(combined_header.len())..]),
                        chunk_start,
                    );
                    bufs.push(UndoBufData::new(
                        if is_first_chunk { UndoBufFlags::CREATE } else { UndoBufFlags::ADD_CHUNK },
                        self.plan.logno,
                        step.block,
                        step.page_off as u16,
                        step.in_off as u32,
                        combined_header[step.in_off..step.in_off + step.len].to_vec(),
                    ));
                }
                StepKind::Record => {
                    let chunk_start = self.plan.new_chunk_start.unwrap_or_else(|| {
                        chunk_table.current(self.handle).map(|c| c.start).unwrap_or(Urp::INVALID)
                    });
                    PageCodec::insert_record(&mut page, step.page_off, step.in_off, record, chunk_start, 0);
                    bufs.push(UndoBufData::new(
                        if self.is_new_chunk() { UndoBufFlags::INSERT } else { UndoBufFlags::ADD_PAGE },
                        self.plan.logno,
                        step.block,
                        step.page_off as u16,
                        step.in_off as u32,
                        record[step.in_off..step.in_off + step.len].to_vec(),
                    ));
                }
            }
        }

        if let Some(chunk_start) = self.plan.new_chunk_start {
            let header_len = combined_header.len() as u64;
            chunk_table.begin_chunk(self.handle, chunk_start, self.set_type, self.previous_chunk, header_len);
        }
        chunk_table.record_bytes(self.handle, record.len() as u64);

        (self.plan.record_urp, bufs)
    }
}

pub struct Writer;

impl Writer {
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_insert(
        buffers: &mut dyn BufferManager,
        allocator: &mut dyn UndoLogAllocator,
        chunk_table: &ChunkTable,
        handle: UrsHandle,
        urs: &Urs,
        record_size: u64,
    ) -> UndoResult<PreparedInsert> {
        let existing_chunk = chunk_table
            .current(handle)
            .map(|c| (c.start.logno, allocator.insertion_point(c.start.logno)));

        let chunk_header_len = CHUNK_HEADER_SIZE + urs.r#type.type_header_size();
        let persistence = urs.persistence;
        let plan = InsertionPlanner::plan(
            allocator,
            |a| a.attach(persistence),
            existing_chunk,
            chunk_header_len,
            record_size,
        )?;

        let mut pages = Vec::new();
        let mut touched: HashSet<u64> = HashSet::new();
        for step in &plan.steps {
            if touched.insert(step.block) {
                let page = Self::pin_or_allocate(buffers, plan.logno, step.block)?;
                pages.push((step.block, page));
            }
        }

        // `size` stays 0 here; `Closer` patches it in once the chunk closes.
        let chunk_header_bytes = plan.new_chunk_start.map(|_| {
            ChunkHeader {
                size: 0,
                previous_chunk: urs.chunk_start,
                r#type: urs.r#type.code(),
            }
            .to_bytes()
            .to_vec()
        });

        Ok(PreparedInsert {
            handle,
            plan,
            pages,
            chunk_header_bytes,
            r#type_header: urs.type_header.clone(),
            set_type: urs.r#type,
            previous_chunk: urs.chunk_start,
        })
    }

    fn pin_or_allocate(buffers: &mut dyn BufferManager, logno: u32, block: u64) -> UndoResult<PageHandle> {
        match buffers.max_block(logno) {
            Some(max) if block <= max => buffers.pin(logno, block),
            _ => buffers.new_page(logno, block),
        }
    }
}
