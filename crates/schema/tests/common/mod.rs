//! Shared helpers for schema-manager integration tests

use std::sync::Arc;

use strata_kv::{dir, tuple, Database, StoreConfig, Transaction};
use strata_schema::ais::{Ais, Column, DataType, Table, TableName};
use strata_schema::{SchemaConfig, SchemaManager, Session};

pub fn open_db() -> Arc<Database> {
    Database::open(StoreConfig::temporary()).unwrap()
}

pub fn start_manager(db: &Arc<Database>) -> SchemaManager {
    SchemaManager::start(db.clone(), SchemaConfig::default()).unwrap()
}

/// Read a tuple-packed counter stored under `schemaManager/<key>`.
pub fn read_counter(db: &Database, key: &str) -> Option<i64> {
    let mut txn = db.begin();
    let sm_dir = dir::open(&mut txn, &["schemaManager"]).unwrap();
    txn.get(&sm_dir.pack_one(key))
        .unwrap()
        .map(|raw| tuple::unpack(&raw).unwrap()[0].as_int().unwrap())
}

/// Create `schema.table` with a single int column through a full
/// transaction, returning the published snapshot.
pub fn create_table(
    manager: &SchemaManager,
    session: &mut Session,
    schema: &str,
    table: &str,
) -> Arc<Ais> {
    manager
        .transact(session, |sm, session, txn| {
            create_table_in_txn(sm, session, txn, schema, table)
        })
        .unwrap()
}

/// The `apply_ddl` body of `create_table`, usable inside a larger
/// transaction.
pub fn create_table_in_txn(
    manager: &SchemaManager,
    session: &mut Session,
    txn: &mut Transaction<'_>,
    schema: &str,
    table: &str,
) -> strata_schema::Result<Arc<Ais>> {
    let name = TableName::new(schema, table);
    let schema_name = schema.to_string();
    manager.apply_ddl(session, txn, move |ais, names| {
        let table_id = names.next_table_id();
        let storage = names.table_storage_name(&name)?;
        ais.add_table(
            Table::new(table_id, name.clone(), vec![Column::new("v", DataType::Int)])
                .with_storage_name(storage),
        )?;
        Ok(vec![schema_name])
    })
}

/// The id of `schema.table` in the current committed snapshot.
pub fn table_id(manager: &SchemaManager, schema: &str, table: &str) -> i32 {
    let mut session = Session::new();
    manager
        .transact(&mut session, |sm, session, txn| {
            let ais = sm.get_ais(session, txn)?;
            Ok(ais
                .table(&TableName::new(schema, table))
                .expect("table should exist")
                .table_id)
        })
        .unwrap()
}
