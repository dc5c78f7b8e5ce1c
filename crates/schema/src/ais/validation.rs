//! Snapshot validation and per-table finalization

use std::collections::{HashMap, HashSet};

use crate::ais::{Ais, Column, DataType, Table};
use crate::error::{Error, Result};

/// Name of the ordinal key column appended to tables declared without a
/// primary key.
pub const HIDDEN_PK_COLUMN: &str = "__row_id";

/// Finalize a table under construction: a table with no declared primary
/// key gets a hidden ordinal key column. Idempotent.
pub fn finish_table(table: &mut Table) {
    if table.primary_key.is_empty() {
        if !table.has_column(HIDDEN_PK_COLUMN) {
            table
                .columns
                .push(Column::new(HIDDEN_PK_COLUMN, DataType::BigInt).not_null());
        }
        table.primary_key = vec![HIDDEN_PK_COLUMN.to_string()];
        table.hidden_pk = true;
    }
}

/// Validate a whole snapshot, accumulating every failure reason.
pub fn validate(ais: &Ais) -> Result<()> {
    let mut reasons = Vec::new();
    let mut table_ids: HashMap<i32, String> = HashMap::new();
    let mut storage_names: HashMap<String, String> = HashMap::new();

    let mut claim_storage = |name: &str, owner: String, reasons: &mut Vec<String>| {
        if let Some(prev) = storage_names.insert(name.to_string(), owner.clone()) {
            reasons.push(format!(
                "storage name {} claimed by both {} and {}",
                name, prev, owner
            ));
        }
    };

    for schema in ais.schemas() {
        if schema.name.is_empty() {
            reasons.push("schema name cannot be empty".to_string());
        }
        for table in schema.tables.values() {
            let display = table.name.to_string();
            if table.name.table.is_empty() {
                reasons.push(format!("table in schema {} has empty name", schema.name));
            }
            if table.table_id < 1 {
                reasons.push(format!("table {} has invalid id {}", display, table.table_id));
            }
            if let Some(prev) = table_ids.insert(table.table_id, display.clone()) {
                reasons.push(format!(
                    "table id {} used by both {} and {}",
                    table.table_id, prev, display
                ));
            }
            if table.columns.is_empty() {
                reasons.push(format!("table {} has no columns", display));
            }

            let mut column_names = HashSet::new();
            for column in &table.columns {
                if column.name.is_empty() {
                    reasons.push(format!("table {} has a column with empty name", display));
                }
                if !column_names.insert(column.name.as_str()) {
                    reasons.push(format!(
                        "table {} has duplicate column {}",
                        display, column.name
                    ));
                }
            }

            if table.primary_key.is_empty() {
                reasons.push(format!("table {} has no primary key", display));
            }
            for pk_column in &table.primary_key {
                match table.columns.iter().find(|c| &c.name == pk_column) {
                    None => reasons.push(format!(
                        "table {} primary key references missing column {}",
                        display, pk_column
                    )),
                    Some(column) if column.nullable => reasons.push(format!(
                        "table {} primary key column {} is nullable",
                        display, pk_column
                    )),
                    Some(_) => {}
                }
            }

            let mut index_ids = HashSet::new();
            for index in table.indexes.values() {
                if !index_ids.insert(index.index_id) {
                    reasons.push(format!(
                        "table {} has duplicate index id {}",
                        display, index.index_id
                    ));
                }
                for column in &index.columns {
                    if !table.has_column(column) {
                        reasons.push(format!(
                            "index {}.{} references missing column {}",
                            display, index.name, column
                        ));
                    }
                }
                if !table.memory_table {
                    claim_storage(
                        &index.storage_name,
                        format!("{}.{}", display, index.name),
                        &mut reasons,
                    );
                }
            }

            if table.memory_table {
                if !table.name.is_system() {
                    reasons.push(format!(
                        "memory table {} outside the system schemas",
                        display
                    ));
                }
            } else if table.storage_name.is_empty() {
                reasons.push(format!("table {} has no storage name", display));
            } else {
                claim_storage(&table.storage_name, display.clone(), &mut reasons);
            }
        }

        for sequence in schema.sequences.values() {
            if sequence.increment == 0 {
                reasons.push(format!(
                    "sequence {}.{} has zero increment",
                    schema.name, sequence.name
                ));
            }
            claim_storage(
                &sequence.storage_name,
                format!("{}.{}", schema.name, sequence.name),
                &mut reasons,
            );
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidSchema { reasons })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::{Index, TableName};

    fn valid_table(id: i32, schema: &str, table: &str) -> Table {
        let mut t = Table::new(
            id,
            TableName::new(schema, table),
            vec![Column::new("id", DataType::BigInt).not_null()],
        )
        .with_primary_key(vec!["id".into()])
        .with_storage_name(format!("data/{}/{}", schema, table));
        finish_table(&mut t);
        t
    }

    #[test]
    fn test_valid_ais_passes() {
        let mut ais = Ais::new();
        ais.add_table(valid_table(1, "test", "a")).unwrap();
        ais.add_table(valid_table(2, "test", "b")).unwrap();
        assert!(validate(&ais).is_ok());
    }

    #[test]
    fn test_hidden_pk_appended_once() {
        let mut table = Table::new(
            1,
            TableName::new("test", "t"),
            vec![Column::new("v", DataType::Int)],
        )
        .with_storage_name("data/test/t");
        finish_table(&mut table);
        assert!(table.hidden_pk);
        assert_eq!(table.primary_key, vec![HIDDEN_PK_COLUMN.to_string()]);
        let columns_before = table.columns.len();
        finish_table(&mut table);
        assert_eq!(table.columns.len(), columns_before);
    }

    #[test]
    fn test_duplicate_table_id_and_storage_name() {
        let mut ais = Ais::new();
        ais.add_table(valid_table(1, "s1", "t")).unwrap();
        let mut dup = valid_table(1, "s2", "t");
        dup.storage_name = "data/s1/t".to_string();
        ais.add_table(dup).unwrap();
        let err = validate(&ais).unwrap_err();
        match err {
            Error::InvalidSchema { reasons } => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].contains("table id 1"));
                assert!(reasons[1].contains("storage name data/s1/t"));
            }
            other => panic!("expected InvalidSchema, got {:?}", other),
        }
    }

    #[test]
    fn test_nullable_pk_and_missing_index_column() {
        let mut table = Table::new(
            3,
            TableName::new("test", "t"),
            vec![Column::new("id", DataType::BigInt)],
        )
        .with_primary_key(vec!["id".into(), "missing".into()])
        .with_storage_name("data/test/t");
        table.add_index(Index {
            index_id: 1,
            name: "i".into(),
            columns: vec!["nope".into()],
            unique: false,
            storage_name: "data/test/t/i".into(),
        });
        let mut ais = Ais::new();
        ais.add_table(table).unwrap();
        let err = validate(&ais).unwrap_err();
        match err {
            Error::InvalidSchema { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("is nullable")));
                assert!(reasons.iter().any(|r| r.contains("missing column missing")));
                assert!(reasons.iter().any(|r| r.contains("missing column nope")));
            }
            other => panic!("expected InvalidSchema, got {:?}", other),
        }
    }

    #[test]
    fn test_memory_table_outside_system_schema_rejected() {
        let mut ais = Ais::new();
        ais.add_table(
            Table::new(
                1,
                TableName::new("user_schema", "m"),
                vec![Column::new("id", DataType::Int).not_null()],
            )
            .with_primary_key(vec!["id".into()])
            .memory(),
        )
        .unwrap();
        assert!(validate(&ais).is_err());
    }
}
