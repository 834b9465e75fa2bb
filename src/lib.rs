//! # Cascade
//!
//! An embedded deductive database engine. A program of declarative rules is
//! installed once; as base facts are inserted or retracted, the engine
//! incrementally maintains every derived relation, firing per-rule operator
//! chains on exactly the freshly-visible deltas (semi-naive evaluation).
//! Deletion is the exact dual of insertion: a refcounted multiset counts
//! the derivations of every tuple, and a tuple leaves its table when the
//! count returns to zero.
//!
//! The language supports stratified negation, head aggregation (`count`,
//! `sum`, `min`, `max`, `avg`), deletion rules, event joins
//! (`t#insert` / `t#delete`), and a location-specifier column that routes
//! derived facts to networked peers.
//!
//! ## Architecture
//!
//! ```text
//! client API ──┐                       ┌─ tables (tuple store + RSet)
//! network rx ──┼─► mailbox ─► router ──┼─ operator chains (scan/filter/agg/insert)
//!              │   (MPSC)    (1 thread)└─ send shim ─► peers
//! shell ───────┘
//! ```
//!
//! The router thread owns every table, pool, and chain; the mailbox is the
//! only cross-thread object. One work item is processed at a time, and all
//! of its synchronous derivations drain before the next item (per-tick
//! fixpoint), so execution is deterministic given the arrival order.
//!
//! ## Usage
//!
//! ```no_run
//! use cascade::{Config, Datum, Engine};
//!
//! let engine = Engine::start(Config::default()).expect("engine starts");
//! engine.install_program(
//!     "define link(int, int); define path(int, int);\n\
//!      path(X, Y) :- link(X, Y);\n\
//!      path(X, Z) :- link(X, Y), path(Y, Z);",
//! ).expect("program installs");
//!
//! engine.install_fact("link", vec![Datum::Int32(1), Datum::Int32(2)]).expect("insert");
//! engine.install_fact("link", vec![Datum::Int32(2), Datum::Int32(3)]).expect("insert");
//! assert_eq!(engine.dump_table("path").expect("snapshot").len(), 3);
//! ```

pub mod analyze;
pub mod ast;
pub mod catalog;
pub mod config;
pub mod error;
pub mod expr;
pub mod operator;
pub mod parser;
pub mod plan;
pub mod router;
pub mod rset;
pub mod storage;
pub mod table;
pub mod tuple;
pub mod value;
pub mod wire;

mod runtime;

pub use catalog::{Catalog, StorageKind, TableDef, TableDefRef};
pub use config::Config;
pub use error::{EvalError, ProgramError, WireError};
pub use router::{TupleCallback, WorkItem};
pub use rset::RSet;
pub use runtime::Engine;
pub use table::{Polarity, Table};
pub use tuple::{Schema, SchemaRef, Tuple, TuplePool};
pub use value::{DataType, Datum};

pub use parser::parse_program;
