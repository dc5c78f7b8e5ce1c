//! Store configuration

use std::path::{Path, PathBuf};

/// The workload here is metadata: many small values, short range scans,
/// and a commit rate bounded by schema changes rather than row traffic.
const DEFAULT_CACHE_BYTES: u64 = 16 * 1024 * 1024;

/// Options for opening a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Filesystem location of the backing keyspace.
    pub data_dir: PathBuf,
    /// Read cache for the backing keyspace, in bytes.
    pub cache_size: u64,
    /// Journal flush policy applied after every committed batch.
    pub persist_mode: fjall::PersistMode,
}

impl StoreConfig {
    /// Open the store at `data_dir` with default tuning.
    pub fn at(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            cache_size: DEFAULT_CACHE_BYTES,
            persist_mode: fjall::PersistMode::Buffer,
        }
    }

    /// A store under a fresh temporary directory. The directory is kept
    /// on disk for the life of the process so a reopened `Database` sees
    /// the same data; anything long-lived should pick a real path via
    /// [`StoreConfig::at`].
    pub fn temporary() -> Self {
        let dir = tempfile::tempdir()
            .expect("temporary directory for store")
            .keep();
        Self::at(dir)
    }

    /// Flush the journal to disk on every commit.
    pub fn durable(mut self) -> Self {
        self.persist_mode = fjall::PersistMode::SyncAll;
        self
    }
}
