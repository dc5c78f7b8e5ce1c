//! Online-change bookkeeping shared by the manager
//!
//! The authority for online state is the KV store itself: one directory
//! per online id holding the staged generation, staged schema fragments,
//! change sets and the row log of concurrent DML. `OnlineCache` is the
//! read-only view a transaction builds from that subtree.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ais::Ais;
use crate::change_set::ChangeSet;

pub(crate) const SCHEMA_MANAGER_PATH: &str = "schemaManager";
pub(crate) const PROTOBUF_PATH: &str = "protobuf";
pub(crate) const ONLINE_PATH: &str = "online";
pub(crate) const CHANGES_PATH: &str = "changes";
pub(crate) const DML_PATH: &str = "dml";
pub(crate) const ONLINE_SESSION_KEY: &str = "onlineSession";
pub(crate) const GENERATION_KEY: &str = "generation";

/// Staged generation value meaning "created but not yet staged".
pub(crate) const UNSET_GENERATION: i64 = -1;

pub(crate) fn protobuf_path() -> Vec<String> {
    vec![SCHEMA_MANAGER_PATH.to_string(), PROTOBUF_PATH.to_string()]
}

pub(crate) fn online_root_path() -> Vec<String> {
    vec![SCHEMA_MANAGER_PATH.to_string(), ONLINE_PATH.to_string()]
}

pub(crate) fn online_dir_path(online_id: i64) -> Vec<String> {
    let mut path = online_root_path();
    path.push(online_id.to_string());
    path
}

pub(crate) fn online_protobuf_path(online_id: i64) -> Vec<String> {
    let mut path = online_dir_path(online_id);
    path.push(PROTOBUF_PATH.to_string());
    path
}

pub(crate) fn online_changes_path(online_id: i64) -> Vec<String> {
    let mut path = online_dir_path(online_id);
    path.push(CHANGES_PATH.to_string());
    path
}

pub(crate) fn online_dml_path(online_id: i64, table_id: i32) -> Vec<String> {
    let mut path = online_dir_path(online_id);
    path.push(DML_PATH.to_string());
    path.push(table_id.to_string());
    path
}

/// Read-only view of every in-flight online change, built per
/// transaction from the online subtree.
#[derive(Debug, Default)]
pub struct OnlineCache {
    /// Staged snapshot per online id, absent until the change is staged.
    pub online_to_ais: HashMap<i64, Arc<Ais>>,
    /// Which online id has staged each schema. At most one per schema.
    pub schema_to_online: HashMap<String, i64>,
    /// Which online id owns each table. At most one per table.
    pub table_to_online: HashMap<i32, i64>,
    /// Registered change sets per online id.
    pub online_to_change_sets: HashMap<i64, Vec<ChangeSet>>,
}

impl OnlineCache {
    /// The online id owning `table_id`, if any.
    pub fn online_for_table(&self, table_id: i32) -> Option<i64> {
        self.table_to_online.get(&table_id).copied()
    }
}
