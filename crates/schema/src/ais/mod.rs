//! The information-schema snapshot (AIS)
//!
//! An `Ais` is the complete metadata picture a transaction operates
//! against: schemas holding tables, indexes, sequences and routines,
//! stamped with the global generation it was committed at. Snapshots are
//! frozen after construction; DDL clones an unfrozen copy, mutates it,
//! and publishes the result at a fresh generation.

mod validation;

pub use validation::{finish_table, validate};

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// System catalog schema; its memory tables are never persisted.
pub const INFORMATION_SCHEMA: &str = "information_schema";
/// Access-control catalog schema, same persistence rules as the above.
pub const SECURITY_SCHEMA: &str = "security_schema";
/// Built-in routine schema; routines here are re-registered at startup.
pub const SYS_SCHEMA: &str = "sys";
/// Installed-jar routine schema, persisted without its routines.
pub const SQLJ_SCHEMA: &str = "sqlj";

/// Generation of the sentinel snapshot used to force a reload.
pub(crate) const SENTINEL_GENERATION: i64 = i64::MIN;

/// A fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Whether this name lives in one of the built-in system schemas.
    pub fn is_system(&self) -> bool {
        matches!(
            self.schema.as_str(),
            INFORMATION_SCHEMA | SECURITY_SCHEMA | SYS_SCHEMA | SQLJ_SCHEMA
        )
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    BigInt,
    Double,
    Text,
    Bytes,
    Bool,
    Timestamp,
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }
}

/// A secondary index over a table's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub index_id: i32,
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Storage path of the index tree, `/`-joined.
    pub storage_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub table_id: i32,
    pub name: TableName,
    /// Per-table version, bumped by every structural change to the table.
    pub version: u32,
    pub columns: Vec<Column>,
    /// Primary key column names. Empty until finalization, which appends
    /// a hidden ordinal key when none was declared.
    pub primary_key: Vec<String>,
    pub hidden_pk: bool,
    pub indexes: BTreeMap<String, Index>,
    /// Storage path of the table's data tree, `/`-joined. Empty for
    /// memory tables, which have no backing storage.
    pub storage_name: String,
    /// Memory tables live only in the process-local overlay and are
    /// never written to the KV store.
    pub memory_table: bool,
}

impl Table {
    pub fn new(table_id: i32, name: TableName, columns: Vec<Column>) -> Self {
        Self {
            table_id,
            name,
            version: 1,
            columns,
            primary_key: Vec::new(),
            hidden_pk: false,
            indexes: BTreeMap::new(),
            storage_name: String::new(),
            memory_table: false,
        }
    }

    pub fn with_primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key = columns;
        self
    }

    pub fn with_storage_name(mut self, storage_name: impl Into<String>) -> Self {
        self.storage_name = storage_name.into();
        self
    }

    pub fn memory(mut self) -> Self {
        self.memory_table = true;
        self.storage_name = String::new();
        self
    }

    pub fn has_column(&self, column_name: &str) -> bool {
        self.columns.iter().any(|c| c.name == column_name)
    }

    pub fn add_index(&mut self, index: Index) {
        self.indexes.insert(index.name.clone(), index);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub storage_name: String,
    pub start: i64,
    pub increment: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    pub language: String,
    pub definition: String,
}

/// One named schema: tables, sequences and routines.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub tables: BTreeMap<String, Table>,
    pub sequences: BTreeMap<String, Sequence>,
    pub routines: BTreeMap<String, Routine>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// The snapshot. Mutable while being built, immutable once frozen.
#[derive(Debug, Clone, PartialEq)]
pub struct Ais {
    generation: i64,
    frozen: bool,
    schemas: BTreeMap<String, Schema>,
}

impl Default for Ais {
    fn default() -> Self {
        Self::new()
    }
}

impl Ais {
    pub fn new() -> Self {
        Self {
            generation: 0,
            frozen: false,
            schemas: BTreeMap::new(),
        }
    }

    /// The reload-forcing sentinel; compares below every real generation.
    pub(crate) fn sentinel() -> Self {
        let mut ais = Self::new();
        ais.generation = SENTINEL_GENERATION;
        ais.frozen = true;
        ais
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_generation(&mut self, generation: i64) -> Result<()> {
        if self.frozen {
            return Err(Error::Internal(
                "cannot set generation on a frozen snapshot".to_string(),
            ));
        }
        self.generation = generation;
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// An unfrozen copy for clone-and-mutate DDL. Keeps the source
    /// generation until the mutated copy is assigned a fresh one.
    pub fn clone_unfrozen(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    pub fn schema_names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.schemas.values().flat_map(|s| s.tables.values())
    }

    pub fn table(&self, name: &TableName) -> Option<&Table> {
        self.schemas.get(&name.schema)?.tables.get(&name.table)
    }

    pub fn table_by_id(&self, table_id: i32) -> Option<&Table> {
        self.tables().find(|t| t.table_id == table_id)
    }

    fn assert_unfrozen(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::Internal(
                "cannot mutate a frozen snapshot".to_string(),
            ));
        }
        Ok(())
    }

    /// The named schema, created empty if absent.
    pub fn schema_mut(&mut self, name: &str) -> Result<&mut Schema> {
        self.assert_unfrozen()?;
        Ok(self
            .schemas
            .entry(name.to_string())
            .or_insert_with(|| Schema::new(name)))
    }

    pub fn add_table(&mut self, table: Table) -> Result<()> {
        let schema = self.schema_mut(&table.name.schema.clone())?;
        schema.tables.insert(table.name.table.clone(), table);
        Ok(())
    }

    pub fn table_mut(&mut self, name: &TableName) -> Result<&mut Table> {
        self.assert_unfrozen()?;
        self.schemas
            .get_mut(&name.schema)
            .and_then(|s| s.tables.get_mut(&name.table))
            .ok_or_else(|| Error::Internal(format!("no such table: {}", name)))
    }

    pub fn remove_table(&mut self, name: &TableName) -> Result<Table> {
        self.assert_unfrozen()?;
        self.schemas
            .get_mut(&name.schema)
            .and_then(|s| s.tables.remove(&name.table))
            .ok_or_else(|| Error::Internal(format!("no such table: {}", name)))
    }

    pub fn add_sequence(&mut self, schema: &str, sequence: Sequence) -> Result<()> {
        let schema = self.schema_mut(schema)?;
        schema.sequences.insert(sequence.name.clone(), sequence);
        Ok(())
    }

    pub fn add_routine(&mut self, schema: &str, routine: Routine) -> Result<()> {
        let schema = self.schema_mut(schema)?;
        schema.routines.insert(routine.name.clone(), routine);
        Ok(())
    }

    pub fn remove_routine(&mut self, schema: &str, name: &str) -> Result<Option<Routine>> {
        self.assert_unfrozen()?;
        Ok(self
            .schemas
            .get_mut(schema)
            .and_then(|s| s.routines.remove(name)))
    }

    /// Every storage path referenced by the snapshot, sorted. Memory
    /// tables have no storage and are skipped.
    pub fn storage_names(&self) -> std::collections::BTreeSet<String> {
        let mut names = std::collections::BTreeSet::new();
        for table in self.tables() {
            if table.memory_table {
                continue;
            }
            names.insert(table.storage_name.clone());
            for index in table.indexes.values() {
                names.insert(index.storage_name.clone());
            }
        }
        for schema in self.schemas.values() {
            for sequence in schema.sequences.values() {
                names.insert(sequence.storage_name.clone());
            }
        }
        names
    }

    pub(crate) fn schemas_map(&self) -> &BTreeMap<String, Schema> {
        &self.schemas
    }

    pub(crate) fn schemas_map_mut(&mut self) -> Result<&mut BTreeMap<String, Schema>> {
        self.assert_unfrozen()?;
        Ok(&mut self.schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table(id: i32, schema: &str, table: &str) -> Table {
        Table::new(
            id,
            TableName::new(schema, table),
            vec![Column::new("id", DataType::BigInt).not_null()],
        )
        .with_primary_key(vec!["id".into()])
        .with_storage_name(format!("data/{}/{}", schema, table))
    }

    #[test]
    fn test_frozen_rejects_mutation() {
        let mut ais = Ais::new();
        ais.add_table(test_table(1, "s", "t")).unwrap();
        ais.freeze();
        assert!(ais.add_table(test_table(2, "s", "u")).is_err());
        assert!(ais.set_generation(5).is_err());
        assert!(ais.clone_unfrozen().add_table(test_table(2, "s", "u")).is_ok());
    }

    #[test]
    fn test_table_lookup_by_name_and_id() {
        let mut ais = Ais::new();
        ais.add_table(test_table(7, "test", "t")).unwrap();
        let name = TableName::new("test", "t");
        assert_eq!(ais.table(&name).unwrap().table_id, 7);
        assert_eq!(ais.table_by_id(7).unwrap().name, name);
        assert!(ais.table_by_id(8).is_none());
    }

    #[test]
    fn test_storage_names_skip_memory_tables() {
        let mut ais = Ais::new();
        ais.add_table(test_table(1, "test", "t")).unwrap();
        ais.add_table(
            Table::new(
                2,
                TableName::new(INFORMATION_SCHEMA, "tables"),
                vec![Column::new("name", DataType::Text)],
            )
            .memory(),
        )
        .unwrap();
        let names = ais.storage_names();
        assert!(names.contains("data/test/t"));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_sentinel_sorts_below_everything() {
        assert!(Ais::sentinel().generation() < Ais::new().generation());
    }
}
