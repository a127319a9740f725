use super::error::UndoError;

pub type UndoResult<T> = std::result::Result<T, UndoError>;
