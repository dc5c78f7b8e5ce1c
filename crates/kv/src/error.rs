//! Error types for the KV facade

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Optimistic validation failed at commit; the transaction read state
    /// that another transaction overwrote. Retriable from scratch.
    #[error("Transaction conflict, retry required")]
    CommitConflict,

    #[error("Directory not found: {0}")]
    NoSuchDirectory(String),

    #[error("Directory already exists: {0}")]
    DirectoryExists(String),

    #[error("Tuple encoding error: {0}")]
    Tuple(String),

    #[error("Key has no strict upper bound")]
    KeyUnbounded,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the failed transaction may succeed if re-run from scratch.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::CommitConflict)
    }
}

impl From<fjall::Error> for Error {
    fn from(e: fjall::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
