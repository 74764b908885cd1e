use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TarnError>;

#[derive(Debug, Error)]
pub enum TarnError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("duplicate key {0}")]
    Duplicate(i64),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("deadlock detected")]
    Deadlock,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corrupt(String),
    #[error("no unpinned frame available")]
    Busy,
    #[error("protocol violation: {0}")]
    Protocol(String),
}
