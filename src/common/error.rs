use thiserror::Error;

/// Caller-visible failures. Programmer errors (a DIRTY set destroyed, a
/// discarded `previous_chunk` found during crash recovery, a live set at
/// process exit, REDO running out of registered buffers with continuations
/// still pending) are modeled as `panic!`/`assert!` instead, per the spec's
/// PANIC/ERROR split, and never appear here.
#[derive(Error, Debug)]
pub enum UndoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to register undo request")]
    UnableToRegister,

    #[error("corrupted undo buf-data: {0}")]
    CorruptBufData(String),

    #[error("undo log {0} is full")]
    LogFull(u32),

    #[error("unexpected rmgr/op for transaction-set close: {0}")]
    UnexpectedXactOp(String),

    #[error("chunk size exceeds expected range during crash scan: {0}")]
    ChunkSizeOverflow(String),

    #[error("invalid undo record pointer")]
    InvalidUrp,
}
