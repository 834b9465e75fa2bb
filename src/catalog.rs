//! Catalog: table definitions for all relations in the engine.
//!
//! The catalog maps relation names to their immutable `TableDef`s. It has a
//! single writer, the router thread at program-load time, and is read-only
//! during evaluation.

use crate::error::ProgramError;
use crate::tuple::SchemaRef;
use std::collections::HashMap;
use std::rc::Rc;

/// Where a table keeps its membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Durable,
}

/// A named relation: schema, storage kind, and (through the schema) the key
/// columns and optional location-specifier column. Immutable once registered.
#[derive(Debug)]
pub struct TableDef {
    pub name: String,
    pub schema: SchemaRef,
    pub storage: StorageKind,
}

pub type TableDefRef = Rc<TableDef>;

impl TableDef {
    pub fn new(name: impl Into<String>, schema: SchemaRef, storage: StorageKind) -> TableDefRef {
        Rc::new(TableDef { name: name.into(), schema, storage })
    }

    pub fn arity(&self) -> usize {
        self.schema.arity()
    }
}

/// Process-local registry of table definitions.
#[derive(Default)]
pub struct Catalog {
    defs: HashMap<String, TableDefRef>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog { defs: HashMap::new() }
    }

    /// Register a definition. Duplicate names are a program error.
    pub fn define(&mut self, def: TableDefRef) -> Result<(), ProgramError> {
        if self.defs.contains_key(&def.name) {
            return Err(ProgramError::DuplicateTable(def.name.clone()));
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TableDefRef> {
        self.defs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    /// All registered relation names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Schema;
    use crate::value::DataType;

    fn link_def() -> TableDefRef {
        let schema = Rc::new(Schema::new(vec![DataType::Int32, DataType::Int32], None, None));
        TableDef::new("link", schema, StorageKind::Memory)
    }

    #[test]
    fn test_define_and_lookup() {
        let mut cat = Catalog::new();
        cat.define(link_def()).expect("fresh define");
        assert!(cat.contains("link"));
        assert!(!cat.contains("path"));
        assert_eq!(cat.get("link").map(|d| d.arity()), Some(2));
    }

    #[test]
    fn test_duplicate_define_rejected() {
        let mut cat = Catalog::new();
        cat.define(link_def()).expect("fresh define");
        let err = cat.define(link_def()).expect_err("duplicate define");
        assert!(matches!(err, ProgramError::DuplicateTable(name) if name == "link"));
    }

    #[test]
    fn test_names_sorted() {
        let mut cat = Catalog::new();
        let s = Rc::new(Schema::new(vec![DataType::Int32], None, None));
        cat.define(TableDef::new("b", Rc::clone(&s), StorageKind::Memory))
            .expect("define");
        cat.define(TableDef::new("a", s, StorageKind::Memory)).expect("define");
        assert_eq!(cat.names(), vec!["a", "b"]);
    }
}
