//! Cross-cutting properties of the schema manager

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{create_table, create_table_in_txn, open_db, read_counter, start_manager, table_id};
use strata_schema::ais::{Ais, Column, DataType, TableName};
use strata_schema::{Change, ChangeSet, Session};

/// Committed generations are strictly increasing and each DDL publishes
/// exactly one.
#[test]
fn test_monotonic_generation() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut session = Session::new();

    let mut generations = vec![read_counter(&db, "generation").unwrap()];
    for i in 0..5 {
        let published = create_table(&manager, &mut session, "test", &format!("t{}", i));
        generations.push(published.generation());
    }
    for window in generations.windows(2) {
        assert_eq!(window[1], window[0] + 1);
    }
    assert_eq!(read_counter(&db, "generation"), Some(5));
}

/// Within one transaction, every `get_ais` returns the same pinned
/// snapshot instance.
#[test]
fn test_session_snapshot_invariance() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut session = Session::new();
    create_table(&manager, &mut session, "test", "t");

    manager
        .transact(&mut session, |sm, session, txn| {
            let first = sm.get_ais(session, txn)?;
            let second = sm.get_ais(session, txn)?;
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(first.generation(), second.generation());
            Ok(())
        })
        .unwrap();
}

/// A DDL session observes its own change immediately; other sessions
/// keep their pinned snapshot until their next transaction.
#[test]
fn test_read_your_writes_and_snapshot_stability() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut ddl_session = Session::new();
    create_table(&manager, &mut ddl_session, "test", "t0");

    let mut reader = Session::new();
    let mut interfered = false;
    let observed = manager
        .transact(&mut reader, |sm, session, txn| {
            let before = sm.get_ais(session, txn)?;
            if !interfered {
                interfered = true;
                // Another session commits a DDL mid-transaction and
                // observes it immediately itself.
                let published = manager
                    .transact(&mut ddl_session, |sm, ddl_session, inner| {
                        let published = create_table_in_txn(sm, ddl_session, inner, "test", "t1")?;
                        let again = sm.get_ais(ddl_session, inner)?;
                        assert!(Arc::ptr_eq(&published, &again));
                        Ok(published)
                    })
                    .unwrap();
                assert!(published.table(&TableName::new("test", "t1")).is_some());
            }
            // Still the same pinned snapshot, whatever happened meanwhile.
            let after = sm.get_ais(session, txn)?;
            assert!(Arc::ptr_eq(&before, &after));
            Ok(before.generation())
        })
        .unwrap();

    // The reader's transaction conflicted on the generation key and
    // reran; its committed attempt saw the new snapshot.
    assert_eq!(observed, 2);
}

/// While an online change is staged, only its owner sees the staged
/// snapshot.
#[test]
fn test_online_isolation() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut owner = Session::new();
    create_table(&manager, &mut owner, "test", "t");
    let tid = table_id(&manager, "test", "t");
    let name = TableName::new("test", "t");

    manager
        .transact(&mut owner, |sm, session, txn| sm.begin_online(session, txn))
        .unwrap();
    manager
        .transact(&mut owner, |sm, session, txn| {
            let base = sm.get_ais(session, txn)?;
            let mut staged = base.clone_unfrozen();
            {
                let table = staged.table_mut(&name)?;
                table.columns.push(Column::new("x", DataType::Int));
                table.version += 1;
            }
            sm.stage_online(session, txn, staged, &["test".to_string()])?;
            sm.add_online_change_set(
                session,
                txn,
                ChangeSet {
                    table_id: tid,
                    table_name: "t".into(),
                    old_schema: "test".into(),
                    new_schema: "test".into(),
                    column_changes: vec![Change::add("x")],
                    index_changes: vec![],
                },
            )
        })
        .unwrap();

    let mut other = Session::new();
    manager
        .transact(&mut other, |sm, session, txn| {
            let ais = sm.get_ais(session, txn)?;
            assert!(!ais.table(&name).unwrap().has_column("x"));
            Ok(())
        })
        .unwrap();

    manager
        .transact(&mut owner, |sm, session, txn| {
            let committed = sm.get_ais(session, txn)?;
            assert!(!committed.table(&name).unwrap().has_column("x"));
            let staged = sm.get_online_ais(session, txn)?;
            assert!(staged.table(&name).unwrap().has_column("x"));
            assert!(staged.generation() < committed.generation());
            Ok(())
        })
        .unwrap();
}

/// Every recorded hkey comes back exactly once, in lexicographic order,
/// and scans resume from a given key.
#[test]
fn test_dml_hkey_log_completeness() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut owner = Session::new();
    create_table(&manager, &mut owner, "test", "t");
    let tid = table_id(&manager, "test", "t");

    manager
        .transact(&mut owner, |sm, session, txn| sm.begin_online(session, txn))
        .unwrap();
    manager
        .transact(&mut owner, |sm, session, txn| {
            sm.add_online_change_set(
                session,
                txn,
                ChangeSet {
                    table_id: tid,
                    table_name: "t".into(),
                    old_schema: "test".into(),
                    new_schema: "test".into(),
                    column_changes: vec![],
                    index_changes: vec![],
                },
            )
        })
        .unwrap();

    let recorded: Vec<Vec<u8>> = vec![
        b"m-middle".to_vec(),
        b"a-first".to_vec(),
        b"z-last".to_vec(),
        b"a-first".to_vec(), // recorded twice, yielded once
        b"b\x00nul".to_vec(),
    ];
    let mut writer = Session::new();
    for hkey in &recorded {
        manager
            .transact(&mut writer, |sm, session, txn| {
                sm.record_online_handled_hkey(session, txn, tid, hkey)
            })
            .unwrap();
    }

    manager
        .transact(&mut owner, |sm, session, txn| {
            let all: Vec<Vec<u8>> = sm
                .scan_online_handled_hkeys(session, txn, tid, None)?
                .collect();
            assert_eq!(
                all,
                vec![
                    b"a-first".to_vec(),
                    b"b\x00nul".to_vec(),
                    b"m-middle".to_vec(),
                    b"z-last".to_vec(),
                ]
            );

            let resumed: Vec<Vec<u8>> = sm
                .scan_online_handled_hkeys(session, txn, tid, Some(b"m-middle"))?
                .collect();
            assert_eq!(resumed, vec![b"m-middle".to_vec(), b"z-last".to_vec()]);
            Ok(())
        })
        .unwrap();
}

/// Recording an hkey for a table with no online change fails.
#[test]
fn test_hkey_without_online_change_rejected() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut session = Session::new();
    create_table(&manager, &mut session, "test", "t");
    let tid = table_id(&manager, "test", "t");

    let outcome = manager.transact(&mut session, |sm, session, txn| {
        sm.record_online_handled_hkey(session, txn, tid, b"h")
    });
    assert_eq!(outcome, Err(strata_schema::Error::NoSuchOnlineChange(tid)));
}

/// Concurrent DDLs that retry on conflict never share ids or storage
/// names.
#[test]
fn test_name_uniqueness_across_conflicting_ddls() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut session_a = Session::new();
    let mut session_b = Session::new();

    // Each A-transaction commits a competing B-transaction between its
    // reads and its commit, forcing A through the retry path.
    for i in 0..3 {
        let mut interfered = false;
        manager
            .transact(&mut session_a, |sm, session, txn| {
                let published = create_table_in_txn(sm, session, txn, "test", &format!("a{}", i))?;
                if !interfered {
                    interfered = true;
                    manager
                        .transact(&mut session_b, |sm, session, inner| {
                            create_table_in_txn(sm, session, inner, "test", &format!("b{}", i))
                                .map(|_| ())
                        })
                        .unwrap();
                }
                Ok(published)
            })
            .unwrap();
    }

    let mut reader = Session::new();
    manager
        .transact(&mut reader, |sm, session, txn| {
            let ais = sm.get_ais(session, txn)?;
            let tables: Vec<_> = ais.tables().collect();
            assert_eq!(tables.len(), 6);

            let ids: HashSet<i32> = tables.iter().map(|t| t.table_id).collect();
            assert_eq!(ids.len(), tables.len());

            let storage: HashSet<&str> =
                tables.iter().map(|t| t.storage_name.as_str()).collect();
            assert_eq!(storage.len(), tables.len());
            Ok(())
        })
        .unwrap();
}

/// A snapshot loaded after restart merges into the name generator, so
/// new ids continue past the persisted ones.
#[test]
fn test_ids_continue_after_restart() {
    let db = open_db();
    let manager = start_manager(&db);
    let mut session = Session::new();
    let first: Arc<Ais> = create_table(&manager, &mut session, "test", "t1");
    let first_id = first.table(&TableName::new("test", "t1")).unwrap().table_id;
    manager.stop();
    drop(manager);

    let manager = start_manager(&db);
    let mut session = Session::new();
    let second = create_table(&manager, &mut session, "test", "t2");
    let second_id = second.table(&TableName::new("test", "t2")).unwrap().table_id;
    assert!(second_id > first_id);
}
