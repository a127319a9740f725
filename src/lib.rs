//! Undo Record Set (URS) engine: groups related undo records — typically
//! all the undo a single transaction produces at one persistence level —
//! into a durable, crash-recoverable sequence of byte ranges inside
//! pre-allocated, append-only undo logs.
//!
//! [`UndoEngine`] is the single entry point a backend holds: it bundles
//! the page cache ([`buffer_manager`]), log allocator ([`log_alloc`]), WAL
//! sink ([`wal`]), and the transaction-close callback ([`xact_undo`])
//! behind `create`/`prepare_insert`/`commit_insert`/`prepare_close`/
//! `commit_close`/`destroy`/`replay`/`close_dangling_sets`.

pub mod buffer_manager;
pub mod chunk_table;
pub mod closer;
pub mod common;
pub mod config;
pub mod crash_recovery;
pub mod engine;
pub mod log_alloc;
pub mod page_codec;
pub mod planner;
pub mod replayer;
pub mod types;
pub mod urs;
pub mod wal;
pub mod writer;
pub mod xact_undo;

use tracing_subscriber::prelude::*;

pub use common::{UndoError, UndoResult};
pub use engine::UndoEngine;

/// Initializes `tracing` the way a long-running backend would: human-
/// readable output to stdout plus a daily-rolling file appender under
/// `config::LOG_PATH`. Tests that want log output should call this once;
/// most unit tests rely on `tracing`'s default no-op subscriber instead.
pub fn init_log() {
    let log_dir = std::path::Path::new(config::LOG_PATH).parent().unwrap();
    let log_filename = std::path::Path::new(config::LOG_PATH)
        .file_name()
        .unwrap()
        .to_str()
        .unwrap();
    std::fs::create_dir_all(log_dir).unwrap();

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_thread_names(true)
        .with_level(true);

    let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive every subsequent log
    // call, and this is only ever invoked once per process.
    Box::leak(Box::new(guard));

    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_names(true)
        .with_level(true);

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config::LOG_LEVEL))
        .with(stdout_log)
        .with(file_log)
        .try_init();
}
