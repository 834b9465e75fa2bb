//! End-to-end engine tests through the embedding API: programs installed
//! into a running router thread, facts through the mailbox, results read
//! back with table snapshots and callbacks.

use cascade::{Config, Datum, Engine, Polarity, ProgramError};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn start_engine() -> Engine {
    let mut config = Config::default();
    config.storage.base_dir = Some(std::env::temp_dir().join("cascade-engine-tests-unused"));
    Engine::start(config).expect("engine starts")
}

fn ints(row: &[i32]) -> Vec<Datum> {
    row.iter().map(|&v| Datum::Int32(v)).collect()
}

fn int_rows(rows: Vec<Vec<Datum>>) -> Vec<Vec<i32>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|d| match d {
                    Datum::Int32(v) => v,
                    other => panic!("expected int column, got {other}"),
                })
                .collect()
        })
        .collect()
}

const CLOSURE: &str = "define link(int, int); define path(int, int);\n\
                       path(X, Y) :- link(X, Y);\n\
                       path(X, Z) :- link(X, Y), path(Y, Z);";

#[test]
fn test_transitive_closure() {
    let engine = start_engine();
    engine.install_program(CLOSURE).expect("installs");
    for edge in [[1, 2], [2, 3], [3, 4]] {
        engine.install_fact("link", ints(&edge)).expect("insert");
    }
    assert_eq!(
        int_rows(engine.dump_table("path").expect("snapshot")),
        vec![vec![1, 2], vec![1, 3], vec![1, 4], vec![2, 3], vec![2, 4], vec![3, 4]]
    );
    engine.shutdown();
}

#[test]
fn test_deleting_a_link_retracts_paths_through_it() {
    let engine = start_engine();
    engine.install_program(CLOSURE).expect("installs");
    for edge in [[1, 2], [2, 3], [3, 4]] {
        engine.install_fact("link", ints(&edge)).expect("insert");
    }
    engine.delete_fact("link", ints(&[2, 3])).expect("delete");
    assert_eq!(
        int_rows(engine.dump_table("path").expect("snapshot")),
        vec![vec![1, 2], vec![3, 4]]
    );
    engine.shutdown();
}

#[test]
fn test_negation_flips_with_blocker() {
    let engine = start_engine();
    engine
        .install_program(
            "define r(int); define s(int); define t(int);\n\
             t(X) :- r(X), not s(X);",
        )
        .expect("installs");
    engine.install_fact("r", ints(&[1])).expect("insert");
    engine.install_fact("r", ints(&[2])).expect("insert");
    engine.install_fact("s", ints(&[2])).expect("insert");
    assert_eq!(int_rows(engine.dump_table("t").expect("snapshot")), vec![vec![1]]);

    engine.install_fact("s", ints(&[1])).expect("insert");
    assert!(engine.dump_table("t").expect("snapshot").is_empty());
    engine.shutdown();
}

#[test]
fn test_aggregation_updates_incrementally() {
    let engine = start_engine();
    engine
        .install_program(
            "define price(string, int); define total(int);\n\
             total(sum<P>) :- price(_, P);",
        )
        .expect("installs");

    engine
        .install_fact("price", vec![Datum::string("a"), Datum::Int32(10)])
        .expect("insert");
    engine
        .install_fact("price", vec![Datum::string("b"), Datum::Int32(20)])
        .expect("insert");
    assert_eq!(int_rows(engine.dump_table("total").expect("snapshot")), vec![vec![30]]);

    engine
        .install_fact("price", vec![Datum::string("c"), Datum::Int32(5)])
        .expect("insert");
    assert_eq!(int_rows(engine.dump_table("total").expect("snapshot")), vec![vec![35]]);
    engine.shutdown();
}

#[test]
fn test_key_equality_counts_duplicates_as_one_member() {
    let engine = start_engine();
    engine.install_program("define kv(int, int) keys(0);").expect("installs");
    engine.install_fact("kv", ints(&[1, 10])).expect("insert");
    engine.install_fact("kv", ints(&[1, 20])).expect("insert");
    assert_eq!(int_rows(engine.dump_table("kv").expect("snapshot")), vec![vec![1, 10]]);

    // Two derivations: the first delete only decrements the count.
    engine.delete_fact("kv", ints(&[1, 0])).expect("delete");
    assert_eq!(int_rows(engine.dump_table("kv").expect("snapshot")), vec![vec![1, 10]]);
    engine.delete_fact("kv", ints(&[1, 0])).expect("delete");
    assert!(engine.dump_table("kv").expect("snapshot").is_empty());
    engine.shutdown();
}

#[test]
fn test_per_producer_fifo_order() {
    let engine = Arc::new(start_engine());
    engine.install_program("define seq(int, int);").expect("installs");

    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = Arc::clone(&observed);
    engine
        .register_callback("seq", move |tuple, _| {
            let producer = tuple.get(0).expect("producer column");
            let step = tuple.get(1).expect("step column");
            if let (Datum::Int32(p), Datum::Int32(s)) = (producer, step) {
                log.lock().push((p, s));
            }
        })
        .expect("callback registers");

    let mut handles = Vec::new();
    for producer in 0..2i32 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for step in 0..50i32 {
                engine.install_fact("seq", ints(&[producer, step])).expect("insert");
            }
        }));
    }
    for h in handles {
        h.join().expect("producer thread");
    }

    // Any interleaving is legal, but each producer's order must hold.
    let events = observed.lock().clone();
    assert_eq!(events.len(), 100);
    for producer in 0..2i32 {
        let steps: Vec<i32> =
            events.iter().filter(|(p, _)| *p == producer).map(|(_, s)| *s).collect();
        assert_eq!(steps, (0..50).collect::<Vec<_>>(), "producer {producer}");
    }
}

#[test]
fn test_callbacks_fire_on_derived_tables() {
    let engine = start_engine();
    engine.install_program(CLOSURE).expect("installs");

    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = Arc::clone(&observed);
    engine
        .register_callback("path", move |tuple, polarity| {
            log.lock().push((tuple.to_string(), polarity));
        })
        .expect("callback registers");

    engine.install_fact("link", ints(&[1, 2])).expect("insert");
    engine.install_fact("link", ints(&[2, 3])).expect("insert");
    engine.delete_fact("link", ints(&[2, 3])).expect("delete");

    let events = observed.lock().clone();
    assert!(events.contains(&("(1, 2)".to_string(), Polarity::Insert)));
    assert!(events.contains(&("(1, 3)".to_string(), Polarity::Insert)));
    assert!(events.contains(&("(1, 3)".to_string(), Polarity::Delete)));
    engine.shutdown();
}

#[test]
fn test_program_errors_are_synchronous() {
    let engine = start_engine();
    let err = engine.install_program("nope(X) :- missing(X);").expect_err("unknown tables");
    assert!(matches!(err, ProgramError::UnknownTable(_)));

    engine.install_program("define named(string);").expect("installs");
    let err = engine.install_fact("named", ints(&[1])).expect_err("type mismatch");
    assert!(matches!(err, ProgramError::TypeMismatch(_)));
    let err = engine.install_fact("ghost", ints(&[1])).expect_err("unknown table");
    assert!(matches!(err, ProgramError::UnknownTable(_)));
    engine.shutdown();
}

#[test]
fn test_program_facts_install_with_the_program() {
    let engine = start_engine();
    engine
        .install_program(&format!("{CLOSURE}\nlink(1, 2); link(2, 3);"))
        .expect("installs");
    assert_eq!(
        int_rows(engine.dump_table("path").expect("snapshot")),
        vec![vec![1, 2], vec![1, 3], vec![2, 3]]
    );
    engine.shutdown();
}

#[test]
fn test_durable_table_recovers_membership() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program = "define durable visits(string, int);";

    {
        let mut config = Config::default();
        config.storage.base_dir = Some(dir.path().to_path_buf());
        let engine = Engine::start(config).expect("engine starts");
        engine.install_program(program).expect("installs");
        engine
            .install_fact("visits", vec![Datum::string("home"), Datum::Int32(3)])
            .expect("insert");
        engine
            .install_fact("visits", vec![Datum::string("away"), Datum::Int32(1)])
            .expect("insert");
        engine
            .delete_fact("visits", vec![Datum::string("away"), Datum::Int32(1)])
            .expect("delete");
        engine.shutdown();
    }

    let mut config = Config::default();
    config.storage.base_dir = Some(dir.path().to_path_buf());
    let engine = Engine::start(config).expect("engine restarts");
    engine.install_program(program).expect("installs");
    let rows = engine.dump_table("visits").expect("snapshot");
    assert_eq!(rows, vec![vec![Datum::string("home"), Datum::Int32(3)]]);
    engine.shutdown();
}

/// Poll a table until `predicate` holds or the deadline passes; network
/// delivery is asynchronous.
fn wait_for(
    engine: &Engine,
    table: &str,
    predicate: impl Fn(&[Vec<Datum>]) -> bool,
) -> Vec<Vec<Datum>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let rows = engine.dump_table(table).expect("snapshot");
        if predicate(&rows) {
            return rows;
        }
        assert!(Instant::now() < deadline, "timed out waiting on {table}: {rows:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_location_specifier_routes_between_nodes() {
    let receiver = start_engine();
    receiver
        .install_program("define greeting(@string, string);")
        .expect("receiver program installs");

    let sender = start_engine();
    sender
        .install_program(
            "define outbox(string, string); define greeting(@string, string);\n\
             greeting(@A, M) :- outbox(A, M);",
        )
        .expect("sender program installs");

    sender
        .install_fact(
            "outbox",
            vec![Datum::string(receiver.local_addr()), Datum::string("hello")],
        )
        .expect("insert");

    let rows = wait_for(&receiver, "greeting", |rows| !rows.is_empty());
    assert_eq!(
        rows,
        vec![vec![Datum::string(receiver.local_addr()), Datum::string("hello")]]
    );
    // The derivation was dispatched, not installed locally.
    assert!(sender.dump_table("greeting").expect("snapshot").is_empty());

    sender.shutdown();
    receiver.shutdown();
}

#[test]
fn test_remote_deletion_propagates() {
    let receiver = start_engine();
    receiver
        .install_program("define alarm(@string, int);")
        .expect("receiver program installs");

    let sender = start_engine();
    sender
        .install_program(
            "define trip(string, int); define alarm(@string, int);\n\
             alarm(@A, V) :- trip(A, V);",
        )
        .expect("sender program installs");

    let addr = Datum::string(receiver.local_addr());
    sender
        .install_fact("trip", vec![addr.clone(), Datum::Int32(9)])
        .expect("insert");
    wait_for(&receiver, "alarm", |rows| !rows.is_empty());

    sender.delete_fact("trip", vec![addr, Datum::Int32(9)]).expect("delete");
    wait_for(&receiver, "alarm", |rows| rows.is_empty());

    sender.shutdown();
    receiver.shutdown();
}
