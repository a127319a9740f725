//! Decides, for one insert, which bytes land on which page before any page
//! is actually touched: whether a new chunk header must be written, how
//! many usable-byte pages the header/record spans, and the `Urp` the
//! inserted record will end up at. `Writer` executes the plan a step at a
//! time against pinned pages; splitting "decide" from "do" is what lets
//! the engine expose a `Prepare`/`Commit` API where only `Commit` touches
//! shared state.

use crate::common::UndoError;
use crate::log_alloc::UndoLogAllocator;
use crate::types::{usable_bytes_per_page, CHUNK_HEADER_SIZE, Urp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Header,
    Record,
}

/// One page's worth of work: `len` bytes starting at `in_off` bytes into
/// the header-or-record being written, landing at `page_off` on `block`.
#[derive(Clone, Copy, Debug)]
pub struct PlanStep {
    pub kind: StepKind,
    pub block: u64,
    pub page_off: usize,
    pub in_off: usize,
    pub len: usize,
}

pub struct InsertionPlan {
    pub logno: u32,
    /// Pointer to the record's first byte (after any new chunk header).
    pub record_urp: Urp,
    /// Pointer to the chunk's header, set only when this insert opens one.
    pub new_chunk_start: Option<Urp>,
    pub steps: Vec<PlanStep>,
}

pub struct InsertionPlanner;

impl InsertionPlanner {
    /// Builds a plan for a `record_size`-byte insert. `chunk_header_len` is
    /// `CHUNK_HEADER_SIZE + type_header.len()` and is only consulted when
    /// `existing_chunk` is `None`, i.e. this insert opens the set's first
    /// chunk.
    pub fn plan(
        allocator: &mut dyn UndoLogAllocator,
        logno_for_new_chunk: impl FnOnce(&mut dyn UndoLogAllocator) -> crate::common::UndoResult<u32>,
        existing_chunk: Option<(u32, u64)>, // (logno, next usable offset inside that chunk's log)
        chunk_header_len: usize,
        record_size: u64,
    ) -> crate::common::UndoResult<InsertionPlan> {
        let (logno, header_urp, record_start_usable) = match existing_chunk {
            Some((logno, _)) => {
                // A continuation can never span logs (reserve_exact never
                // rolls over), so a `LogFull` here means this insert simply
                // cannot be registered against the set's current chunk.
                let record_urp = allocator
                    .reserve_exact(logno, record_size)
                    .map_err(|_| UndoError::UnableToRegister)?;
                (logno, None, record_urp.offset)
            }
            None => {
                let logno = logno_for_new_chunk(allocator)?;
                let total = chunk_header_len as u64 + record_size;
                let (logno, header_urp) = allocator.reserve(logno, total)?;
                let record_offset = header_urp.offset + chunk_header_len as u64;
                (logno, Some(header_urp), record_offset)
            }
        };

        let mut steps = Vec::new();
        if let Some(header_urp) = header_urp {
            Self::split_into_steps(StepKind::Header, header_urp.offset, chunk_header_len as u64, &mut steps);
        }
        Self::split_into_steps(StepKind::Record, record_start_usable, record_size, &mut steps);

        Ok(InsertionPlan {
            logno,
            record_urp: Urp::new(logno, record_start_usable),
            new_chunk_start: header_urp,
            steps,
        })
    }

    fn split_into_steps(kind: StepKind, start_usable: u64, len: u64, steps: &mut Vec<PlanStep>) {
        for (block, page_off, in_off, take) in split_usable_range(start_usable, len) {
            steps.push(PlanStep { kind, block, page_off, in_off, len: take });
        }
    }
}

/// Splits a `len`-byte run starting at usable-byte offset `start_usable`
/// into `(block, page_off, in_off, len)` chunks, one per page it crosses.
/// Shared by the insertion planner and `Closer`'s size-field overwrite,
/// which both need to know how many pages a run of bytes touches before
/// pinning them.
pub fn split_usable_range(start_usable: u64, len: u64) -> Vec<(u64, usize, usize, usize)> {
    let per_page = usable_bytes_per_page() as u64;
    let mut remaining = len;
    let mut usable = start_usable;
    let mut in_off = 0usize;
    let mut out = Vec::new();
    while remaining > 0 {
        let block = usable / per_page;
        let offset_in_page_usable = usable % per_page;
        let room_on_page = per_page - offset_in_page_usable;
        let take = room_on_page.min(remaining);
        out.push((block, crate::page_codec::usable_offset_to_page_offset(usable), in_off, take as usize));
        usable += take;
        in_off += take as usize;
        remaining -= take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_alloc::FileUndoLogAllocator;
    use crate::types::Persistence;
    use tempfile::tempdir;

    #[test]
    fn new_chunk_plan_includes_header_step() {
        let dir = tempdir().unwrap();
        let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
        let plan = InsertionPlanner::plan(
            &mut alloc,
            |a| a.attach(Persistence::Permanent),
            None,
            CHUNK_HEADER_SIZE + 8,
            32,
        )
        .unwrap();
        assert!(plan.new_chunk_start.is_some());
        assert_eq!(plan.steps[0].kind, StepKind::Header);
        assert_eq!(plan.record_urp.offset, (CHUNK_HEADER_SIZE + 8) as u64);
    }

    #[test]
    fn continuation_plan_has_no_header_step() {
        let dir = tempdir().unwrap();
        let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
        let logno = alloc.attach(Persistence::Permanent).unwrap();
        alloc.reserve(logno, 64).unwrap();
        let plan = InsertionPlanner::plan(
            &mut alloc,
            |a| a.attach(Persistence::Permanent),
            Some((logno, 64)),
            0,
            16,
        )
        .unwrap();
        assert!(plan.new_chunk_start.is_none());
        assert!(plan.steps.iter().all(|s| s.kind == StepKind::Record));
    }

    #[test]
    fn plan_splits_across_page_boundary() {
        let dir = tempdir().unwrap();
        let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
        let logno = alloc.attach(Persistence::Permanent).unwrap();
        let per_page = usable_bytes_per_page() as u64;
        alloc.reserve(logno, per_page - 10).unwrap();
        let plan = InsertionPlanner::plan(&mut alloc, |a| a.attach(Persistence::Permanent), Some((logno, per_page - 10)), 0, 20).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].len, 10);
        assert_eq!(plan.steps[1].len, 10);
    }
}
