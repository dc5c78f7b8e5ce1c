//! Ordered, transactional key-value facade
//!
//! This crate is the storage seam for the schema layer above it:
//! - tuple-packed, order-preserving keys (`tuple`)
//! - hierarchical named subspaces with stable byte prefixes (`dir`)
//! - optimistic serializable transactions with a retry loop (`store`)
//!
//! The backing engine is a fjall keyspace; conflict detection is
//! read-set validation under a single commit lock.

pub mod dir;
pub mod tuple;

mod config;
mod error;
mod store;

pub use config::StoreConfig;
pub use dir::Directory;
pub use error::{Error, Result};
pub use store::{Database, Transaction};
pub use tuple::Element;
