//! # Tables
//!
//! A `Table` pairs a membership store with an `RSet` recording the
//! multiplicity with which each distinct tuple has been derived. A tuple is
//! a member iff its multiset count is at least one; the count makes deletion
//! the exact dual of insertion. The store behind the membership is uniform:
//! an in-memory set by default, a write-through durable store otherwise.

use crate::catalog::{StorageKind, TableDefRef};
use crate::rset::RSet;
use crate::storage::{DurableStore, StorageError};
use crate::tuple::{Tuple, TuplePool};
use crate::value::Datum;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;

/// Polarity of a work item or derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Insert,
    Delete,
}

impl Polarity {
    pub fn flip(self) -> Polarity {
        match self {
            Polarity::Insert => Polarity::Delete,
            Polarity::Delete => Polarity::Insert,
        }
    }
}

/// Outcome of a table deletion.
pub enum DeleteOutcome {
    /// The multiset count reached zero; the canonical tuple left membership.
    /// The caller inherits the membership pin and must unpin when done.
    Removed(Tuple),
    /// The count was decremented but the tuple is still a member.
    Counted(u32),
    /// The tuple was never a member.
    Absent,
}

/// Uniform membership interface. The store keeps one pinned handle per
/// member; insert and remove are called only on visibility changes.
pub trait TupleStore {
    fn insert(&mut self, t: Tuple) -> Result<(), StorageError>;
    fn remove(&mut self, t: &Tuple) -> Result<(), StorageError>;
    fn iter(&self) -> Box<dyn Iterator<Item = &Tuple> + '_>;
    fn len(&self) -> usize;
}

/// In-memory membership set, keyed by the tuple key columns.
#[derive(Default, Debug)]
pub struct MemStore {
    tuples: HashSet<Tuple>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore { tuples: HashSet::new() }
    }
}

impl TupleStore for MemStore {
    fn insert(&mut self, t: Tuple) -> Result<(), StorageError> {
        self.tuples.insert(t);
        Ok(())
    }

    fn remove(&mut self, t: &Tuple) -> Result<(), StorageError> {
        self.tuples.remove(t);
        Ok(())
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Tuple> + '_> {
        Box::new(self.tuples.iter())
    }

    fn len(&self) -> usize {
        self.tuples.len()
    }
}

/// One live relation: definition, tuple pool, multiset accounting, and the
/// membership store.
pub struct Table {
    def: TableDefRef,
    pool: TuplePool,
    rset: RSet<Tuple>,
    store: Box<dyn TupleStore>,
}

impl Table {
    /// Create the table, opening (and replaying) the durable store when the
    /// definition asks for one.
    pub fn create(def: TableDefRef, base_dir: &Path) -> Result<Table, StorageError> {
        let pool = TuplePool::new(Rc::clone(&def.schema));
        match def.storage {
            StorageKind::Memory => Ok(Table {
                def,
                pool,
                rset: RSet::new(),
                store: Box::new(MemStore::new()),
            }),
            StorageKind::Durable => {
                let (store, rows) = DurableStore::open(&def, base_dir)?;
                let mut table =
                    Table { def, pool, rset: RSet::new(), store: Box::new(store) };
                table.seed(rows)?;
                Ok(table)
            }
        }
    }

    pub fn def(&self) -> &TableDefRef {
        &self.def
    }

    pub fn pool(&self) -> &TuplePool {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Multiset count for one tuple.
    pub fn count(&self, t: &Tuple) -> u32 {
        self.rset.get(t)
    }

    /// Record one derivation of `t`. Returns true iff the tuple just became
    /// visible, in which case the store now holds its own pin on it.
    pub fn insert(&mut self, t: &Tuple) -> bool {
        let was_new = self.rset.add(t.clone());
        if was_new {
            if let Err(e) = self.store.insert(t.pin()) {
                tracing::error!(table = %self.def.name, error = %e, "membership write failed");
            }
        }
        was_new
    }

    /// Retract one derivation of the tuple matching `probe`'s key columns.
    pub fn delete(&mut self, probe: &Tuple) -> DeleteOutcome {
        match self.rset.remove(probe) {
            None => DeleteOutcome::Absent,
            Some((_, rc)) if rc > 0 => DeleteOutcome::Counted(rc),
            Some((canonical, _)) => {
                if let Err(e) = self.store.remove(&canonical) {
                    tracing::error!(table = %self.def.name, error = %e, "membership remove failed");
                }
                // The pin the store held transfers to the returned handle.
                DeleteOutcome::Removed(canonical)
            }
        }
    }

    /// Iterate current members. Hash order; not part of any contract.
    pub fn scan(&self) -> impl Iterator<Item = &Tuple> {
        self.store.iter()
    }

    /// Snapshot the member rows, sorted for deterministic output.
    pub fn snapshot(&self) -> Vec<Vec<Datum>> {
        let mut rows: Vec<Vec<Datum>> = self.scan().map(|t| t.values().clone()).collect();
        rows.sort();
        rows
    }

    /// Install rows recovered from a durable store: each becomes a member
    /// with multiset count 1 and no chain firing.
    fn seed(&mut self, rows: Vec<Vec<Datum>>) -> Result<(), StorageError> {
        for row in rows {
            let t = self.pool.loan_values(row);
            let was_new = self.rset.add(t.clone());
            if was_new {
                // Seeded directly into the in-memory image: the row is
                // already in the log.
                self.store.insert(t)?;
            } else {
                t.unpin();
            }
        }
        Ok(())
    }
}

/// The set of live tables, owned by the router thread.
#[derive(Default)]
pub struct Tables {
    map: std::collections::HashMap<String, Table>,
}

impl Tables {
    pub fn new() -> Tables {
        Tables { map: std::collections::HashMap::new() }
    }

    pub fn insert(&mut self, table: Table) {
        self.map.insert(table.def().name.clone(), table);
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.map.get_mut(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StorageKind, TableDef};
    use crate::tuple::Schema;
    use crate::value::DataType;

    fn test_table(key: Option<Vec<usize>>) -> Table {
        let schema = Rc::new(Schema::new(vec![DataType::Int32, DataType::Int32], key, None));
        let def = TableDef::new("t", schema, StorageKind::Memory);
        Table::create(def, Path::new(".")).expect("memory table")
    }

    fn loan(table: &Table, a: i32, b: i32) -> Tuple {
        table.pool().loan_values(vec![Datum::Int32(a), Datum::Int32(b)])
    }

    #[test]
    fn test_membership_tracks_rset_count() {
        let mut table = test_table(None);
        let t = loan(&table, 1, 2);

        assert!(table.insert(&t));
        assert_eq!(table.count(&t), 1);
        assert_eq!(table.len(), 1);

        assert!(!table.insert(&t));
        assert_eq!(table.count(&t), 2);
        assert_eq!(table.len(), 1);

        assert!(matches!(table.delete(&t), DeleteOutcome::Counted(1)));
        assert_eq!(table.len(), 1);

        match table.delete(&t) {
            DeleteOutcome::Removed(canonical) => canonical.unpin(),
            _ => panic!("expected final delete to remove membership"),
        }
        assert_eq!(table.len(), 0);
        assert_eq!(table.count(&t), 0);

        t.unpin();
    }

    #[test]
    fn test_delete_absent() {
        let mut table = test_table(None);
        let t = loan(&table, 9, 9);
        assert!(matches!(table.delete(&t), DeleteOutcome::Absent));
        t.unpin();
    }

    #[test]
    fn test_first_inserted_nonkey_values_retained() {
        let mut table = test_table(Some(vec![0]));
        let first = loan(&table, 1, 10);
        let second = loan(&table, 1, 20);

        assert!(table.insert(&first));
        assert!(!table.insert(&second));
        assert_eq!(table.count(&second), 2);

        let rows = table.snapshot();
        assert_eq!(rows, vec![vec![Datum::Int32(1), Datum::Int32(10)]]);

        first.unpin();
        second.unpin();
    }

    #[test]
    fn test_scan_sees_members() {
        let mut table = test_table(None);
        for (a, b) in [(1, 2), (2, 3), (3, 4)] {
            let t = loan(&table, a, b);
            table.insert(&t);
            t.unpin();
        }
        assert_eq!(table.scan().count(), 3);
    }
}
