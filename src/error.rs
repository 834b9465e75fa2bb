//! Engine Error Types
//!
//! Three families, matching how failures propagate: `ProgramError` is
//! reported synchronously to the caller that installed the program or fact,
//! `EvalError` aborts a single derivation inside the router and is logged,
//! and `WireError` rejects one inbound network frame.

use thiserror::Error;

/// Errors reported to the embedding caller. A failed program installs
/// nothing; rejection is atomic.
#[derive(Error, Debug)]
pub enum ProgramError {
    /// Syntax error in the program text
    #[error("parse error: {0}")]
    Parse(String),

    /// Reference to a table with no `define`
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Unrecognized type name in a `define`
    #[error("unknown type name: {0}")]
    UnknownType(String),

    /// Second `define` for the same table name
    #[error("duplicate table definition: {0}")]
    DuplicateTable(String),

    /// Wrong number of columns in a table reference
    #[error("table {table} expects {expected} columns, got {got}")]
    ArityMismatch { table: String, expected: usize, got: usize },

    /// Column expression does not match the declared column type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Head or negated-atom variable not bound by a positive body atom
    #[error("unsafe rule: {0}")]
    UnsafeRule(String),

    /// Negation cycle in the rule dependency graph
    #[error("program cannot be stratified: {0}")]
    Unstratifiable(String),

    /// Malformed aggregate in a rule head
    #[error("invalid aggregate: {0}")]
    InvalidAggregate(String),

    /// `@` marker used on a column that is not the schema's location column
    #[error("invalid location specifier: {0}")]
    InvalidLocSpec(String),

    /// Durable store could not be opened or written at table creation
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    /// The router thread is gone; no further work can be submitted
    #[error("engine is shut down")]
    EngineShutdown,
}

/// Errors raised while evaluating an expression over a tuple pair. The
/// offending derivation is dropped and the engine continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("modulus by zero")]
    ModulusByZero,

    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    /// Operand type did not match the plan-time type; indicates a planning bug
    #[error("operand type confusion in {0}")]
    Type(&'static str),
}

/// Errors decoding an inbound network frame. The frame is dropped.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,

    #[error("unknown type tag {0:#04x}")]
    BadTag(u8),

    #[error("unknown polarity byte {0:#04x}")]
    BadPolarity(u8),

    #[error("frame checksum mismatch")]
    BadChecksum,

    #[error("invalid utf-8 in string payload")]
    Utf8(#[from] std::string::FromUtf8Error),
}
