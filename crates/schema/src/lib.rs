//! Schema management for a SQL layer on an ordered transactional KV store
//!
//! This crate is the consistency kernel of the layer: it persists,
//! versions and distributes the information-schema snapshot (AIS) across
//! concurrent sessions and across nodes sharing one KV backend, while
//! supporting online schema changes that run concurrently with DML.
//!
//! - every transaction gets one coherent, immutable snapshot
//! - DDL stages new snapshots without disturbing concurrent readers
//! - DML against a table under online change logs its row keys so the
//!   change can finalize correctly
//! - the global generation counter totally orders published snapshots
//! - external wipes and version mismatches fail loudly, never silently

pub mod ais;
pub mod codec;

mod change_set;
mod error;
mod generation;
mod manager;
mod name_generator;
mod online;
mod session;

pub use change_set::{Change, ChangeKind, ChangeSet};
pub use error::{Error, Result};
pub use generation::{CURRENT_DATA_VERSION, CURRENT_META_VERSION};
pub use manager::{HkeyScan, SchemaConfig, SchemaManager};
pub use name_generator::{
    data_path, storage_path, DefaultNameGenerator, PathKind, StorageNameGenerator,
};
pub use online::OnlineCache;
pub use session::{OnlineSession, Session};
