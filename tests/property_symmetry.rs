//! Property tests (proptest): inserting a multiset of facts and then
//! deleting the same multiset leaves every table, base and derived, empty.

use cascade::{Config, Datum, Engine};
use proptest::prelude::*;

fn start_engine() -> Engine {
    Engine::start(Config::default()).expect("engine starts")
}

fn edge_strategy() -> impl Strategy<Value = Vec<((i32, i32), u8)>> {
    // Small node ids force shared endpoints and derivation sharing.
    proptest::collection::vec(((0..5i32, 0..5i32), 1..3u8), 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn insert_then_delete_leaves_tables_empty(edges in edge_strategy()) {
        let engine = start_engine();
        engine
            .install_program(
                "define link(int, int); define path(int, int);\n\
                 path(X, Y) :- link(X, Y);\n\
                 path(X, Z) :- link(X, Y), path(Y, Z);",
            )
            .expect("installs");

        for ((a, b), n) in &edges {
            for _ in 0..*n {
                engine
                    .install_fact("link", vec![Datum::Int32(*a), Datum::Int32(*b)])
                    .expect("insert");
            }
        }
        for ((a, b), n) in &edges {
            for _ in 0..*n {
                engine
                    .delete_fact("link", vec![Datum::Int32(*a), Datum::Int32(*b)])
                    .expect("delete");
            }
        }

        prop_assert!(engine.dump_table("link").expect("snapshot").is_empty());
        prop_assert!(engine.dump_table("path").expect("snapshot").is_empty());
        engine.shutdown();
    }

    #[test]
    fn materialization_is_insertion_order_independent(edges in edge_strategy()) {
        let program = "define link(int, int); define path(int, int);\n\
                       path(X, Y) :- link(X, Y);\n\
                       path(X, Z) :- link(X, Y), path(Y, Z);";

        let forward = start_engine();
        forward.install_program(program).expect("installs");
        for ((a, b), _) in &edges {
            forward
                .install_fact("link", vec![Datum::Int32(*a), Datum::Int32(*b)])
                .expect("insert");
        }

        let reverse = start_engine();
        reverse.install_program(program).expect("installs");
        for ((a, b), _) in edges.iter().rev() {
            reverse
                .install_fact("link", vec![Datum::Int32(*a), Datum::Int32(*b)])
                .expect("insert");
        }

        prop_assert_eq!(
            forward.dump_table("path").expect("snapshot"),
            reverse.dump_table("path").expect("snapshot")
        );
        forward.shutdown();
        reverse.shutdown();
    }
}
