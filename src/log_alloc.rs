//! Allocates space inside the 1 TiB-per-log undo address space and decides
//! when to roll over to a fresh `logno`. Grounded in the teacher's
//! `storage::allocator::Allocator`: a small piece of persisted metadata
//! (there, `entry_size`/`entries_per_page`/free-list heads; here, each
//! log's insertion/discard offsets) that every caller reads before
//! touching pages, plus the same "serialize as fixed little-endian fields"
//! style `Allocator::to_bytes`/`from_bytes` use.

use crate::common::{UndoError, UndoResult};
use crate::config::UNDO_LOG_ADDRESS_SPACE;
use crate::types::{Persistence, Urp};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Per-log bookkeeping: how far it's been written (`insert_usable`), how
/// far it's been discarded (`discard_usable`), and whether it has been
/// closed off because a new chunk wouldn't fit before the address-space
/// limit.
#[derive(Clone, Copy, Debug)]
struct LogMeta {
    persistence: Persistence,
    insert_usable: u64,
    discard_usable: u64,
    full: bool,
}

/// Collaborator that owns the set of open undo logs and their tail
/// pointers. `InsertionPlanner` calls `reserve` for every byte range it
/// needs to write; the allocator decides whether that range fits in the
/// log currently attached for that persistence level or whether a new
/// `logno` must be opened first.
pub trait UndoLogAllocator: Send {
    /// Returns the `logno` currently accepting new chunks for `persistence`,
    /// opening one if none exists yet.
    fn attach(&mut self, persistence: Persistence) -> UndoResult<u32>;

    /// Reserves `nbytes` usable bytes in `logno`, returning the `Urp` the
    /// reservation starts at. Rolls over to a new log and returns its first
    /// `logno`/offset instead when `logno` doesn't have room left. Used
    /// when starting a brand new chunk, which is free to land in whatever
    /// log is currently attached.
    fn reserve(&mut self, logno: u32, nbytes: u64) -> UndoResult<(u32, Urp)>;

    /// Reserves `nbytes` usable bytes in exactly `logno`, failing with
    /// `UndoError::LogFull` instead of rolling over. Used for continuing an
    /// already-open chunk, which can never span two logs.
    fn reserve_exact(&mut self, logno: u32, nbytes: u64) -> UndoResult<Urp>;

    fn insertion_point(&self, logno: u32) -> u64;
    fn discard_point(&self, logno: u32) -> u64;

    /// Every `logno` this allocator knows about, for crash recovery's scan.
    fn known_lognos(&self) -> Vec<u32>;

    /// Advances the discard pointer, e.g. after a background discard worker
    /// confirms no backend can still see undo data before `new_discard`.
    fn advance_discard(&mut self, logno: u32, new_discard: u64);
}

/// File-backed allocator: one metadata file per open log under the pool
/// directory, `<logno>.meta`, holding `insert_usable`/`discard_usable` as
/// little-endian `u64`s (mirroring `Allocator::to_bytes`'s fixed-field
/// layout, just for two fields instead of four).
pub struct FileUndoLogAllocator {
    dir: PathBuf,
    logs: HashMap<u32, LogMeta>,
    next_logno: u32,
}

impl FileUndoLogAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> UndoResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut logs = HashMap::new();
        let mut next_logno = 0u32;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".meta") {
                if let Ok(logno) = stem.parse::<u32>() {
                    let bytes = fs::read(entry.path())?;
                    logs.insert(logno, LogMeta::from_bytes(&bytes));
                    next_logno = next_logno.max(logno + 1);
                }
            }
        }
        Ok(Self { dir, logs, next_logno })
    }

    fn meta_path(&self, logno: u32) -> PathBuf {
        self.dir.join(format!("{}.meta", logno))
    }

    fn persist(&self, logno: u32) -> UndoResult<()> {
        let meta = self.logs.get(&logno).expect("persist called for unknown log");
        fs::write(self.meta_path(logno), meta.to_bytes())?;
        Ok(())
    }

    fn open_new_log(&mut self, persistence: Persistence) -> UndoResult<u32> {
        let logno = self.next_logno;
        self.next_logno += 1;
        self.logs.insert(
            logno,
            LogMeta {
                persistence,
                insert_usable: 0,
                discard_usable: 0,
                full: false,
            },
        );
        self.persist(logno)?;
        Ok(logno)
    }
}

impl LogMeta {
    fn to_bytes(&self) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[0] = match self.persistence {
            Persistence::Permanent => 0,
            Persistence::Unlogged => 1,
            Persistence::Temp => 2,
        };
        buf[1..9].copy_from_slice(&self.insert_usable.to_le_bytes());
        buf[9..17].copy_from_slice(&self.discard_usable.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let persistence = match bytes[0] {
            0 => Persistence::Permanent,
            1 => Persistence::Unlogged,
            _ => Persistence::Temp,
        };
        let insert_usable = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let discard_usable = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
        LogMeta {
            persistence,
            insert_usable,
            discard_usable,
            full: insert_usable >= UNDO_LOG_ADDRESS_SPACE,
        }
    }
}

impl UndoLogAllocator for FileUndoLogAllocator {
    fn attach(&mut self, persistence: Persistence) -> UndoResult<u32> {
        if let Some((&logno, _)) = self
            .logs
            .iter()
            .find(|(_, meta)| meta.persistence == persistence && !meta.full)
        {
            return Ok(logno);
        }
        self.open_new_log(persistence)
    }

    fn reserve(&mut self, logno: u32, nbytes: u64) -> UndoResult<(u32, Urp)> {
        let persistence = self.logs.get(&logno).map(|m| m.persistence).unwrap_or(Persistence::Permanent);
        let meta = self.logs.get_mut(&logno).expect("reserve called for unknown log");

        if meta.insert_usable + nbytes > UNDO_LOG_ADDRESS_SPACE {
            meta.full = true;
            self.persist(logno)?;
            let new_logno = self.open_new_log(persistence)?;
            return self.reserve(new_logno, nbytes);
        }

        let urp = Urp::new(logno, meta.insert_usable);
        meta.insert_usable += nbytes;
        self.persist(logno)?;
        Ok((logno, urp))
    }

    fn reserve_exact(&mut self, logno: u32, nbytes: u64) -> UndoResult<Urp> {
        let meta = self.logs.get_mut(&logno).expect("reserve_exact called for unknown log");
        if meta.insert_usable + nbytes > UNDO_LOG_ADDRESS_SPACE {
            meta.full = true;
            self.persist(logno)?;
            return Err(UndoError::LogFull(logno));
        }
        let urp = Urp::new(logno, meta.insert_usable);
        meta.insert_usable += nbytes;
        self.persist(logno)?;
        Ok(urp)
    }

    fn insertion_point(&self, logno: u32) -> u64 {
        self.logs.get(&logno).map(|m| m.insert_usable).unwrap_or(0)
    }

    fn discard_point(&self, logno: u32) -> u64 {
        self.logs.get(&logno).map(|m| m.discard_usable).unwrap_or(0)
    }

    fn known_lognos(&self) -> Vec<u32> {
        self.logs.keys().copied().collect()
    }

    fn advance_discard(&mut self, logno: u32, new_discard: u64) {
        if let Some(meta) = self.logs.get_mut(&logno) {
            meta.discard_usable = new_discard;
            let _ = self.persist(logno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn attach_reuses_same_log_until_full() {
        let dir = tempdir().unwrap();
        let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
        let l1 = alloc.attach(Persistence::Permanent).unwrap();
        let l2 = alloc.attach(Persistence::Permanent).unwrap();
        assert_eq!(l1, l2);
    }

    #[test]
    fn reserve_advances_insertion_point() {
        let dir = tempdir().unwrap();
        let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
        let logno = alloc.attach(Persistence::Permanent).unwrap();
        let (_, urp1) = alloc.reserve(logno, 100).unwrap();
        let (_, urp2) = alloc.reserve(logno, 50).unwrap();
        assert_eq!(urp1.offset, 0);
        assert_eq!(urp2.offset, 100);
        assert_eq!(alloc.insertion_point(logno), 150);
    }

    #[test]
    fn reserve_rolls_over_when_log_would_overflow() {
        let dir = tempdir().unwrap();
        let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
        let logno = alloc.attach(Persistence::Permanent).unwrap();
        // Force the log near the address-space ceiling.
        alloc.logs.get_mut(&logno).unwrap().insert_usable = UNDO_LOG_ADDRESS_SPACE - 10;
        let (new_logno, urp) = alloc.reserve(logno, 100).unwrap();
        assert_ne!(new_logno, logno);
        assert_eq!(urp.logno, new_logno);
        assert_eq!(urp.offset, 0);
    }

    #[test]
    fn metadata_survives_reload() {
        let dir = tempdir().unwrap();
        let logno = {
            let mut alloc = FileUndoLogAllocator::new(dir.path()).unwrap();
            let logno = alloc.attach(Persistence::Permanent).unwrap();
            alloc.reserve(logno, 64).unwrap();
            logno
        };
        let alloc2 = FileUndoLogAllocator::new(dir.path()).unwrap();
        assert_eq!(alloc2.insertion_point(logno), 64);
    }
}
