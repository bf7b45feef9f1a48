///
/// # Shadow-Name Pool Integration Test
///
/// The trampoline pool is process-wide, so everything that depends on its
/// occupancy runs as one sequential test in its own binary.
///

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use rusqlite::Connection;
use rusqlite::config::DbConfig;
use vtbridge::{
    FailureOrigin, ModuleOptions, RegisterError, SHADOW_POOL_CAPACITY, ShadowNamePool,
    clear_unraisable_hook, register_module, set_unraisable_hook,
};

use common::{Events, MemFactory, message};

fn connection_with_module(events: &Events, name: &str, abi_version: i32) -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to open database");
    register_module(
        &conn,
        name,
        MemFactory::new(events),
        ModuleOptions::default().with_abi_version(abi_version),
    )
    .expect("Failed to register module");
    conn
}

#[test]
fn test_pool_exhaustion_reuse_and_shadow_names() {
    let events = Events::new();
    assert_eq!(ShadowNamePool::capacity(), SHADOW_POOL_CAPACITY);
    assert_eq!(ShadowNamePool::free_slots(), SHADOW_POOL_CAPACITY);

    // Fill every slot, one module per connection.
    let mut held: Vec<Connection> = (0..SHADOW_POOL_CAPACITY - 1)
        .map(|i| connection_with_module(&events, &format!("m{}", i), 3))
        .collect();
    held.push(connection_with_module(&events, "last", 4));
    assert_eq!(ShadowNamePool::free_slots(), 0);
    assert_eq!(ShadowNamePool::live_slots().len(), SHADOW_POOL_CAPACITY);
    assert!(
        ShadowNamePool::live_slots().iter().any(|(_, name)| name == "last"),
        "Live slots should name their modules"
    );

    // One more fails before anything is registered.
    let conn = Connection::open_in_memory().expect("Failed to open database");
    let err = register_module(
        &conn,
        "late",
        MemFactory::new(&events),
        ModuleOptions::default().with_abi_version(4),
    )
    .unwrap_err();
    match &err {
        RegisterError::Host(host) => {
            assert_eq!(host.origin(), FailureOrigin::Exhausted);
            assert!(host.message().contains("no shadow-name slots"), "{}", host.message());
        }
        other => panic!("Expected an exhausted pool, got {:?}", other),
    }
    let err = conn.execute_batch("CREATE VIRTUAL TABLE t USING late").unwrap_err();
    assert!(message(&err).contains("no such module: late"));

    // Modules below ABI 3 never take a slot.
    register_module(
        &conn,
        "plain",
        MemFactory::new(&events),
        ModuleOptions::default().with_abi_version(2),
    )
    .expect("Registration without a shadow slot should succeed");

    // Closing a connection returns its module's slot.
    drop(held.pop());
    assert_eq!(ShadowNamePool::free_slots(), 1);
    register_module(
        &conn,
        "late",
        MemFactory::new(&events),
        ModuleOptions::default().with_abi_version(4),
    )
    .expect("A released slot should be reusable");
    assert_eq!(ShadowNamePool::free_slots(), 0);

    // Shadow-name questions reach the factory in defensive mode.
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DEFENSIVE, true)
        .expect("Failed to enable defensive mode");
    conn.execute_batch("CREATE VIRTUAL TABLE t USING late")
        .expect("Failed to create table");

    let err = conn.execute_batch("CREATE TABLE t_data(x)").unwrap_err();
    assert!(message(&err).contains("reserved for internal use"), "{}", message(&err));
    assert!(events.all().contains(&"shadow_name data".to_string()));

    conn.execute_batch("CREATE TABLE t_other(x)")
        .expect("Non-shadow names should be accepted");

    let seen = Rc::new(RefCell::new(Vec::<String>::new()));
    let sink = seen.clone();
    set_unraisable_hook(move |err| sink.borrow_mut().push(err.message().to_string()));
    let created = conn.execute_batch("CREATE TABLE t_boom(x)");
    clear_unraisable_hook();
    assert!(created.is_ok(), "A failing lookup should answer 'not a shadow table'");
    let seen = seen.borrow();
    assert!(!seen.is_empty(), "The failed lookup should be reported");
    assert!(seen.iter().all(|m| m == "shadow lookup failed"), "{:?}", seen);

    // Dropping everything empties the pool.
    drop(conn);
    drop(held);
    assert_eq!(ShadowNamePool::free_slots(), SHADOW_POOL_CAPACITY);
}
