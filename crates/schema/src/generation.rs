//! Generation counter and stored-version bookkeeping
//!
//! The single `generation` key is the rendezvous point for every node
//! sharing the KV store: all snapshot readers fetch it, all DDL reads
//! then writes it, so committed schema changes are totally ordered.

use strata_kv::{tuple, Directory, Transaction};

use crate::error::{Error, Result};

/// Bumped when the physical layout of user data changes.
pub const CURRENT_DATA_VERSION: i64 = 5;
/// Bumped when the layout of the metadata itself changes.
pub const CURRENT_META_VERSION: i64 = 3;

const GENERATION_KEY: &str = "generation";
const DATA_VERSION_KEY: &str = "dataVersion";
const META_VERSION_KEY: &str = "metaDataVersion";

/// Outcome of comparing stored versions against the running constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// Neither version key present: a fresh store.
    Missing,
    Compatible,
    Incompatible { stored_meta: i64, stored_data: i64 },
}

/// Packed keys for the global counters, cached once at startup.
#[derive(Debug, Clone)]
pub struct GenerationRegistry {
    packed_gen_key: Vec<u8>,
    packed_data_ver_key: Vec<u8>,
    packed_meta_ver_key: Vec<u8>,
}

impl GenerationRegistry {
    pub fn new(sm_dir: &Directory) -> Self {
        Self {
            packed_gen_key: sm_dir.pack_one(GENERATION_KEY),
            packed_data_ver_key: sm_dir.pack_one(DATA_VERSION_KEY),
            packed_meta_ver_key: sm_dir.pack_one(META_VERSION_KEY),
        }
    }

    fn read_i64(txn: &mut Transaction<'_>, key: &[u8]) -> Result<Option<i64>> {
        match txn.get(key)? {
            Some(raw) => {
                let elements = tuple::unpack(&raw).map_err(Error::Kv)?;
                match elements.first() {
                    Some(element) => Ok(Some(element.as_int().map_err(Error::Kv)?)),
                    None => Err(Error::Internal("empty counter tuple".to_string())),
                }
            }
            None => Ok(None),
        }
    }

    /// The generation this transaction observes. A missing key means the
    /// metadata was cleared underneath us.
    pub fn transactional_generation(&self, txn: &mut Transaction<'_>) -> Result<i64> {
        Self::read_i64(txn, &self.packed_gen_key)?.ok_or(Error::ExternalClear)
    }

    /// Read, increment and write the generation.
    pub fn next_generation(&self, txn: &mut Transaction<'_>) -> Result<i64> {
        let next = self.transactional_generation(txn)? + 1;
        self.save_generation(txn, next);
        Ok(next)
    }

    pub fn save_generation(&self, txn: &mut Transaction<'_>, value: i64) {
        txn.set(&self.packed_gen_key, &tuple::pack_one(value));
    }

    /// Write the version constants and a zero generation.
    pub fn save_initial_state(&self, txn: &mut Transaction<'_>) {
        txn.set(
            &self.packed_data_ver_key,
            &tuple::pack_one(CURRENT_DATA_VERSION),
        );
        txn.set(
            &self.packed_meta_ver_key,
            &tuple::pack_one(CURRENT_META_VERSION),
        );
        self.save_generation(txn, 0);
    }

    pub fn data_compatibility(&self, txn: &mut Transaction<'_>) -> Result<Compatibility> {
        let stored_data = Self::read_i64(txn, &self.packed_data_ver_key)?;
        let stored_meta = Self::read_i64(txn, &self.packed_meta_ver_key)?;
        match (stored_meta, stored_data) {
            (None, _) | (_, None) => Ok(Compatibility::Missing),
            (Some(meta), Some(data)) => {
                if meta == CURRENT_META_VERSION && data == CURRENT_DATA_VERSION {
                    Ok(Compatibility::Compatible)
                } else {
                    Ok(Compatibility::Incompatible {
                        stored_meta: meta,
                        stored_data: data,
                    })
                }
            }
        }
    }

    /// Per-load check of an already-initialized store. Missing keys can
    /// only mean an external clear; give a clear message, no recovery.
    pub fn check_data_versions(&self, txn: &mut Transaction<'_>) -> Result<()> {
        match self.data_compatibility(txn)? {
            Compatibility::Compatible => Ok(()),
            Compatibility::Missing => Err(Error::ExternalClear),
            Compatibility::Incompatible {
                stored_meta,
                stored_data,
            } => Err(Error::Incompatible {
                supported_meta: CURRENT_META_VERSION,
                supported_data: CURRENT_DATA_VERSION,
                stored_meta,
                stored_data,
            }),
        }
    }

    pub(crate) fn packed_generation_key(&self) -> &[u8] {
        &self.packed_gen_key
    }

    pub(crate) fn packed_data_version_key(&self) -> &[u8] {
        &self.packed_data_ver_key
    }

    pub(crate) fn packed_meta_version_key(&self) -> &[u8] {
        &self.packed_meta_ver_key
    }
}
