//! Identifier and storage-name allocation
//!
//! A `DefaultNameGenerator` tracks every id and storage name already in
//! use in-process; `merge_ais` folds a freshly loaded snapshot into it.
//! `StorageNameGenerator` layers a transaction on top and claims the
//! backing directory for each minted name, so the claim commits (or
//! conflicts) together with the DDL that asked for it. Cross-node
//! uniqueness of ids follows from the generation discipline: only one
//! schema-changing transaction commits per generation.

use std::collections::{BTreeSet, HashMap};

use strata_kv::{dir, Transaction};

use crate::ais::{Ais, TableName};
use crate::error::Result;

const DATA_PATH: &str = "data";
const ONLINE_DATA_PATH: &str = "onlineData";
const SEQUENCE_PATH: &str = "_sequence";

/// In-process tracker of used table ids, index ids and storage names.
#[derive(Debug, Default)]
pub struct DefaultNameGenerator {
    used_table_ids: BTreeSet<i32>,
    max_index_id: HashMap<i32, i32>,
    used_storage_names: BTreeSet<String>,
}

impl DefaultNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ais(ais: &Ais) -> Self {
        let mut generator = Self::new();
        generator.merge_ais(ais);
        generator
    }

    /// Fold every id and storage name of `ais` into the tracker.
    pub fn merge_ais(&mut self, ais: &Ais) {
        for table in ais.tables() {
            self.used_table_ids.insert(table.table_id);
            for index in table.indexes.values() {
                let max = self.max_index_id.entry(table.table_id).or_insert(0);
                *max = (*max).max(index.index_id);
                self.used_storage_names.insert(index.storage_name.clone());
            }
            if !table.memory_table {
                self.used_storage_names.insert(table.storage_name.clone());
            }
        }
        for schema in ais.schemas() {
            for sequence in schema.sequences.values() {
                self.used_storage_names.insert(sequence.storage_name.clone());
            }
        }
    }

    pub fn next_table_id(&mut self) -> i32 {
        let mut candidate = self.used_table_ids.iter().next_back().map_or(1, |m| m + 1);
        while !self.used_table_ids.insert(candidate) {
            candidate += 1;
        }
        candidate
    }

    pub fn next_index_id(&mut self, table_id: i32) -> i32 {
        let max = self.max_index_id.entry(table_id).or_insert(0);
        *max += 1;
        *max
    }

    pub fn is_storage_name_used(&self, name: &str) -> bool {
        self.used_storage_names.contains(name)
    }

    fn claim_storage_name(&mut self, name: String) -> bool {
        self.used_storage_names.insert(name)
    }
}

/// Which directory tree a minted storage name claims under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Committed table data.
    Data,
    /// Trees built by an in-flight online change.
    Online,
}

impl PathKind {
    fn root(self) -> &'static str {
        match self {
            PathKind::Data => DATA_PATH,
            PathKind::Online => ONLINE_DATA_PATH,
        }
    }
}

/// The committed data path of a table.
pub fn data_path(name: &TableName) -> Vec<String> {
    vec![
        DATA_PATH.to_string(),
        name.schema.clone(),
        name.table.clone(),
    ]
}

/// Split a stored storage name back into its directory path.
pub fn storage_path(storage_name: &str) -> Vec<String> {
    storage_name.split('/').map(str::to_string).collect()
}

/// A name generator whose mints claim KV directories inside `txn`.
pub struct StorageNameGenerator<'a, 'db> {
    inner: &'a mut DefaultNameGenerator,
    txn: &'a mut Transaction<'db>,
    kind: PathKind,
}

impl<'a, 'db> StorageNameGenerator<'a, 'db> {
    pub fn new(
        inner: &'a mut DefaultNameGenerator,
        txn: &'a mut Transaction<'db>,
        kind: PathKind,
    ) -> Self {
        Self { inner, txn, kind }
    }

    pub fn next_table_id(&mut self) -> i32 {
        self.inner.next_table_id()
    }

    pub fn next_index_id(&mut self, table_id: i32) -> i32 {
        self.inner.next_index_id(table_id)
    }

    /// Mint and claim the storage name for a table.
    pub fn table_storage_name(&mut self, name: &TableName) -> Result<String> {
        self.claim(vec![name.schema.clone(), name.table.clone()])
    }

    /// Mint and claim the storage name for an index of a table.
    pub fn index_storage_name(&mut self, table: &TableName, index: &str) -> Result<String> {
        self.claim(vec![
            table.schema.clone(),
            table.table.clone(),
            index.to_string(),
        ])
    }

    /// Mint and claim the storage name for a sequence.
    pub fn sequence_storage_name(&mut self, schema: &str, sequence: &str) -> Result<String> {
        self.claim(vec![
            schema.to_string(),
            SEQUENCE_PATH.to_string(),
            sequence.to_string(),
        ])
    }

    /// Claim the first free variant of `tail` under this generator's
    /// root: the plain path, then `$2`, `$3`, ... suffixes.
    fn claim(&mut self, tail: Vec<String>) -> Result<String> {
        let mut attempt = 1;
        loop {
            let mut path: Vec<String> = vec![self.kind.root().to_string()];
            path.extend(tail.iter().cloned());
            if attempt > 1 {
                let last = path.len() - 1;
                path[last] = format!("{}${}", path[last], attempt);
            }
            let joined = path.join("/");
            if !self.inner.is_storage_name_used(&joined) && !dir::exists(self.txn, &path)? {
                dir::create_or_open(self.txn, &path)?;
                self.inner.claim_storage_name(joined.clone());
                return Ok(joined);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::{Column, DataType, Index, Table};
    use strata_kv::{Database, StoreConfig};

    #[test]
    fn test_table_ids_skip_merged() {
        let mut ais = Ais::new();
        ais.add_table(
            Table::new(
                5,
                TableName::new("s", "t"),
                vec![Column::new("id", DataType::Int).not_null()],
            )
            .with_primary_key(vec!["id".into()])
            .with_storage_name("data/s/t"),
        )
        .unwrap();

        let mut generator = DefaultNameGenerator::from_ais(&ais);
        assert_eq!(generator.next_table_id(), 6);
        assert_eq!(generator.next_table_id(), 7);
    }

    #[test]
    fn test_index_ids_per_table() {
        let mut ais = Ais::new();
        let mut table = Table::new(
            1,
            TableName::new("s", "t"),
            vec![Column::new("id", DataType::Int).not_null()],
        )
        .with_primary_key(vec!["id".into()])
        .with_storage_name("data/s/t");
        table.add_index(Index {
            index_id: 3,
            name: "i".into(),
            columns: vec!["id".into()],
            unique: false,
            storage_name: "data/s/t/i".into(),
        });
        ais.add_table(table).unwrap();

        let mut generator = DefaultNameGenerator::from_ais(&ais);
        assert_eq!(generator.next_index_id(1), 4);
        assert_eq!(generator.next_index_id(1), 5);
        assert_eq!(generator.next_index_id(2), 1);
    }

    #[test]
    fn test_storage_claim_dedupes_against_kv() {
        let db = Database::open(StoreConfig::temporary()).unwrap();
        let name = TableName::new("test", "t");
        db.transact(|txn| {
            dir::create_or_open(txn, &["data", "test", "t"])?;
            Ok(())
        })
        .unwrap();

        let mut tracker = DefaultNameGenerator::new();
        let mut txn = db.begin();
        let mut generator = StorageNameGenerator::new(&mut tracker, &mut txn, PathKind::Data);
        let first = generator.table_storage_name(&name).unwrap();
        assert_eq!(first, "data/test/t$2");
        let second = generator.table_storage_name(&name).unwrap();
        assert_eq!(second, "data/test/t$3");
        txn.commit().unwrap();
    }

    #[test]
    fn test_online_path_kind_claims_separately() {
        let db = Database::open(StoreConfig::temporary()).unwrap();
        let name = TableName::new("test", "t");
        let mut tracker = DefaultNameGenerator::new();
        let mut txn = db.begin();
        let mut generator = StorageNameGenerator::new(&mut tracker, &mut txn, PathKind::Online);
        assert_eq!(
            generator.table_storage_name(&name).unwrap(),
            "onlineData/test/t"
        );
        let mut generator = StorageNameGenerator::new(&mut tracker, &mut txn, PathKind::Data);
        assert_eq!(generator.table_storage_name(&name).unwrap(), "data/test/t");
        txn.commit().unwrap();
    }
}
