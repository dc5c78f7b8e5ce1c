//! Error types for the schema manager

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Required metadata keys are gone from the KV store. Someone cleared
    /// it underneath us; only a restart can recover.
    #[error("Schema metadata has been externally modified. Restart required")]
    ExternalClear,

    #[error(
        "Unsupported (meta,data) versions: supported ({supported_meta},{supported_data}) \
         vs present ({stored_meta},{stored_data})"
    )]
    Incompatible {
        supported_meta: i64,
        supported_data: i64,
        stored_meta: i64,
        stored_data: i64,
    },

    #[error("Invalid schema: {}", reasons.join("; "))]
    InvalidSchema { reasons: Vec<String> },

    #[error("Conflicting online change: {0}")]
    ConflictingOnlineChange(String),

    #[error("No online change for table: {0}")]
    NoSuchOnlineChange(i32),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Kv(#[from] strata_kv::Error),
}

impl Error {
    /// Whether the operation may succeed if its transaction is re-run.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Kv(e) if e.is_retriable())
    }
}
