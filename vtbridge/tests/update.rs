///
/// # Update Integration Tests
///
/// INSERT, UPDATE and DELETE through the single xUpdate entry point, rowid
/// read-back, read-only tables and no-change columns.
///

mod common;

use rusqlite::Connection;
use vtbridge::{ModuleOptions, TableCapabilities, register_module};

use common::{Events, MemFactory, Rows, int, message, query, text};

fn mem_table(events: &Events, options: ModuleOptions) -> Connection {
    common::init_tracing();
    let conn = Connection::open_in_memory().expect("Failed to open database");
    register_module(&conn, "mem", MemFactory::new(events), options)
        .expect("Failed to register module");
    conn.execute_batch("CREATE VIRTUAL TABLE t USING mem")
        .expect("Failed to create table");
    conn
}

#[test]
fn test_insert_reads_back_assigned_rowid() {
    let events = Events::new();
    let conn = mem_table(&events, ModuleOptions::default());

    conn.execute("INSERT INTO t(a, b) VALUES ('first', 1)", []).unwrap();
    assert!(events.all().contains(&"insert None Abort".to_string()));
    assert_eq!(conn.last_insert_rowid(), 42);

    let rows = query(&conn, "SELECT rowid, a FROM t").unwrap();
    assert_eq!(rows, vec![vec![int(42), text("first")]]);
}

#[test]
fn test_explicit_rowid_is_kept() {
    let events = Events::new();
    let conn = mem_table(&events, ModuleOptions::default());

    conn.execute("INSERT INTO t(rowid, a, b) VALUES (7, 'seven', 7)", []).unwrap();
    assert!(events.all().contains(&"insert Some(7) Abort".to_string()));

    let rows = query(&conn, "SELECT rowid, a, b FROM t").unwrap();
    assert_eq!(rows, vec![vec![int(7), text("seven"), int(7)]]);
}

#[test]
fn test_conflict_mode_is_visible() {
    let events = Events::new();
    let conn = mem_table(&events, ModuleOptions::default());

    conn.execute("INSERT OR REPLACE INTO t(a, b) VALUES ('x', 1)", []).unwrap();
    assert!(events.all().contains(&"insert None Replace".to_string()));
}

#[test]
fn test_change_and_delete_dispatch() {
    let events = Events::new();
    let conn = mem_table(&events, ModuleOptions::default());
    conn.execute_batch(
        "INSERT INTO t(rowid, a, b) VALUES (1, 'one', 1), (2, 'two', 2);
         UPDATE t SET a = 'uno' WHERE rowid = 1;
         UPDATE t SET rowid = 20 WHERE rowid = 2;
         DELETE FROM t WHERE rowid = 20;",
    )
    .unwrap();

    let all = events.all();
    assert!(all.contains(&"change 1 1 0".to_string()), "{:?}", all);
    assert!(all.contains(&"change 2 20 0".to_string()), "{:?}", all);
    assert!(all.contains(&"delete 20".to_string()), "{:?}", all);

    let rows = query(&conn, "SELECT rowid, a, b FROM t").unwrap();
    assert_eq!(rows, vec![vec![int(1), text("uno"), int(1)]]);
}

#[test]
fn test_host_constraint_failure_keeps_its_code() {
    let events = Events::new();
    let conn = mem_table(&events, ModuleOptions::default());
    conn.execute("INSERT INTO t(rowid, a) VALUES (3, 'x')", []).unwrap();

    let err = conn.execute("INSERT INTO t(rowid, a) VALUES (3, 'y')", []).unwrap_err();
    assert!(message(&err).contains("rowid 3 already exists"));
    assert!(matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    ));
}

#[test]
fn test_table_without_update_is_read_only() {
    let events = Events::new();
    let conn = Connection::open_in_memory().unwrap();
    let factory = MemFactory::new(&events).with_capabilities(TableCapabilities {
        update: false,
        ..TableCapabilities::all()
    });
    register_module(&conn, "mem", factory, ModuleOptions::default()).unwrap();
    conn.execute_batch("CREATE VIRTUAL TABLE t USING mem").unwrap();

    let err = conn.execute("INSERT INTO t(a) VALUES ('x')", []).unwrap_err();
    assert!(message(&err).contains("table t is read-only"), "{}", message(&err));
    assert!(matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ReadOnly
    ));
    assert_eq!(events.count("insert"), 0);
}

#[test]
fn test_unchanged_columns_are_not_refetched() {
    let events = Events::new();
    let rows = Rows::default();
    let conn = Connection::open_in_memory().unwrap();
    register_module(
        &conn,
        "mem",
        MemFactory::new(&events).with_rows(&rows),
        ModuleOptions::default().no_change_columns(),
    )
    .unwrap();
    conn.execute_batch(
        "CREATE VIRTUAL TABLE t USING mem;
         INSERT INTO t(rowid, a, b) VALUES (1, 'one', 'large');
         UPDATE t SET a = 'uno' WHERE rowid = 1;",
    )
    .unwrap();

    let all = events.all();
    assert!(all.contains(&"column_no_change 1".to_string()), "{:?}", all);
    assert!(all.contains(&"change 1 1 1".to_string()), "{:?}", all);

    let rows = query(&conn, "SELECT a, b FROM t").unwrap();
    assert_eq!(rows, vec![vec![text("uno"), text("large")]]);
}
