//! This file provides the static configuration for the undo record set engine.
//! Caution: if you change the on-disk sizes below, existing undo logs become
//! unreadable; bump a format version before shipping such a change.

pub const _NAME: &str = "undo-urs";
pub const _VERSION: &str = "0.1.0";

pub const LOG_LEVEL: &str = "debug";
pub const LOG_PATH: &str = "./logs/urs.log";

/// Fixed page size. The spec allows up to 32768; we fix at the common 8 KiB.
pub const BLCKSZ: usize = 8192;

/// Address space reserved per undo log (1 TiB), matching the spec's undo log.
pub const UNDO_LOG_ADDRESS_SPACE: u64 = 1u64 << 40;

/// Directory holding one file per undo log slot.
pub const UNDO_DIR: &str = "./undo";

/// Size of the filler payload for the `XLOG_NOOP` crash-recovery closer.
/// Preserved at 24 bytes for WAL compatibility; see DESIGN.md's note on the
/// "without relcache" TODO this mirrors.
pub const XLOG_NOOP_DUMMY_SIZE: usize = 24;

/// Timeout used by test harnesses that simulate lock contention.
pub const LOCK_TIMEOUT_MS: u64 = 2000;

/// Initial page-cache capacity (in pages) for a fresh `PagePool`.
pub const DEFAULT_BUFFER_POOL_PAGES: usize = 256;
