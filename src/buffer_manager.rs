//! Page cache and file-backed storage for undo logs, one open file per
//! `logno` under a configured directory. Grounded in the teacher's
//! `storage::storage::StorageManager`/`Page` (file handling, write-back on
//! eviction) and `storage::storage::cache::LRUCache` (eviction policy),
//! generalized from a single-file page index to a `(logno, block)` key
//! shared across every open undo log.

use crate::common::UndoResult;
use crate::config::{BLCKSZ, DEFAULT_BUFFER_POOL_PAGES, UNDO_DIR};
use linked_hash_map::LinkedHashMap;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// One page of an undo log: exactly `BLCKSZ` bytes. Shared so a caller can
/// hold a lock across a `PageCodec` call without re-fetching from the pool.
pub type PageHandle = Arc<RwLock<Vec<u8>>>;

/// Collaborator that hands out pages by `(logno, block)` and is responsible
/// for persisting them. The engine only ever pins, allocates, and flushes;
/// eviction policy and on-disk layout are the implementation's business.
pub trait BufferManager: Send {
    fn pin(&mut self, logno: u32, block: u64) -> UndoResult<PageHandle>;
    fn new_page(&mut self, logno: u32, block: u64) -> UndoResult<PageHandle>;
    fn mark_dirty(&mut self, logno: u32, block: u64);
    fn flush(&mut self) -> UndoResult<()>;
    fn max_block(&self, logno: u32) -> Option<u64>;
}

struct CachedPage {
    handle: PageHandle,
    dirty: bool,
}

/// LRU page cache backed by one file per `logno`. Eviction writes a dirty
/// page back before dropping it from the cache, same as the teacher's
/// `write_back_evicted_page`.
pub struct PagePool {
    dir: PathBuf,
    files: HashMap<u32, Mutex<File>>,
    file_blocks: HashMap<u32, u64>,
    pages: LinkedHashMap<(u32, u64), CachedPage>,
    capacity: usize,
}

impl PagePool {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> UndoResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: HashMap::new(),
            file_blocks: HashMap::new(),
            pages: LinkedHashMap::new(),
            capacity,
        })
    }

    pub fn with_default_dir() -> UndoResult<Self> {
        Self::new(UNDO_DIR, DEFAULT_BUFFER_POOL_PAGES)
    }

    fn path_for(&self, logno: u32) -> PathBuf {
        self.dir.join(format!("{:08}.undo", logno))
    }

    fn ensure_file_open(&mut self, logno: u32) -> UndoResult<()> {
        if self.files.contains_key(&logno) {
            return Ok(());
        }
        let path = self.path_for(logno);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let blocks = file.metadata()?.len() / BLCKSZ as u64;
        self.file_blocks.insert(logno, blocks);
        self.files.insert(logno, Mutex::new(file));
        Ok(())
    }

    fn write_back(&mut self, logno: u32, block: u64, handle: &PageHandle) -> UndoResult<()> {
        self.ensure_file_open(logno)?;
        let file = self.files.get(&logno).unwrap();
        let mut file = file.lock().unwrap();
        let required_blocks = block + 1;
        let known_blocks = *self.file_blocks.get(&logno).unwrap();
        if required_blocks > known_blocks {
            file.set_len(required_blocks * BLCKSZ as u64)?;
            self.file_blocks.insert(logno, required_blocks);
        }
        let data = handle.read().unwrap();
        file.seek(SeekFrom::Start(block * BLCKSZ as u64))?;
        file.write_all(&data)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_from_disk(&mut self, logno: u32, block: u64) -> UndoResult<Vec<u8>> {
        self.ensure_file_open(logno)?;
        let file = self.files.get(&logno).unwrap();
        let mut file = file.lock().unwrap();
        let mut buf = vec![0u8; BLCKSZ];
        file.seek(SeekFrom::Start(block * BLCKSZ as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn evict_if_needed(&mut self) -> UndoResult<()> {
        while self.pages.len() > self.capacity {
            let evicted = self.pages.pop_front();
            if let Some(((logno, block), cached)) = evicted {
                if cached.dirty {
                    self.write_back(logno, block, &cached.handle)?;
                }
            }
        }
        Ok(())
    }

    fn insert_cached(&mut self, logno: u32, block: u64, handle: PageHandle, dirty: bool) -> UndoResult<()> {
        self.pages.remove(&(logno, block));
        self.pages.insert((logno, block), CachedPage { handle, dirty });
        self.evict_if_needed()
    }
}

impl BufferManager for PagePool {
    fn pin(&mut self, logno: u32, block: u64) -> UndoResult<PageHandle> {
        if let Some(cached) = self.pages.get_refresh(&(logno, block)) {
            return Ok(Arc::clone(&cached.handle));
        }
        let data = self.read_from_disk(logno, block)?;
        let handle: PageHandle = Arc::new(RwLock::new(data));
        self.insert_cached(logno, block, Arc::clone(&handle), false)?;
        Ok(handle)
    }

    fn new_page(&mut self, logno: u32, block: u64) -> UndoResult<PageHandle> {
        let mut data = vec![0u8; BLCKSZ];
        crate::page_codec::PageCodec::init_page(&mut data);
        let handle: PageHandle = Arc::new(RwLock::new(data));
        self.insert_cached(logno, block, Arc::clone(&handle), true)?;
        Ok(handle)
    }

    fn mark_dirty(&mut self, logno: u32, block: u64) {
        if let Some(cached) = self.pages.get_refresh(&(logno, block)) {
            cached.dirty = true;
        }
    }

    fn flush(&mut self) -> UndoResult<()> {
        let keys: Vec<(u32, u64)> = self.pages.keys().copied().collect();
        for (logno, block) in keys {
            let (dirty, handle) = match self.pages.get(&(logno, block)) {
                Some(c) => (c.dirty, Arc::clone(&c.handle)),
                None => continue,
            };
            if dirty {
                self.write_back(logno, block, &handle)?;
                if let Some(c) = self.pages.get_mut(&(logno, block)) {
                    c.dirty = false;
                }
            }
        }
        for file in self.files.values() {
            file.lock().unwrap().flush()?;
        }
        Ok(())
    }

    fn max_block(&self, logno: u32) -> Option<u64> {
        let cached_max = self
            .pages
            .keys()
            .filter(|(l, _)| *l == logno)
            .map(|(_, b)| *b)
            .max();
        let file_max = self
            .file_blocks
            .get(&logno)
            .and_then(|n| if *n > 0 { Some(*n - 1) } else { None });
        match (cached_max, file_max) {
            (None, None) => None,
            (Some(c), None) => Some(c),
            (None, Some(f)) => Some(f),
            (Some(c), Some(f)) => Some(c.max(f)),
        }
    }
}
