//! # Tuples and Tuple Pools
//!
//! A `Tuple` is a refcounted, schema-qualified vector of datums. Equality and
//! hashing are defined over the key columns only, so two tuples with equal
//! keys and differing non-key values are the same table member. Tuple buffers
//! are loaned out of a per-schema `TuplePool` and returned to its free list
//! when the last pin is dropped; buffers go back to the allocator only when
//! the whole pool is torn down.

use crate::value::{DataType, Datum};
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

/// Number of tuple buffers allocated the first time a pool grows.
const INITIAL_POOL_SIZE: usize = 64;

/// Column layout of one relation: ordered column types, the subset of
/// columns forming the key, and an optional location-specifier column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    types: Vec<DataType>,
    key: Vec<usize>,
    loc_col: Option<usize>,
}

pub type SchemaRef = Rc<Schema>;

impl Schema {
    /// Build a schema. When `key` is `None` every column is a key column.
    pub fn new(types: Vec<DataType>, key: Option<Vec<usize>>, loc_col: Option<usize>) -> Schema {
        let key = key.unwrap_or_else(|| (0..types.len()).collect());
        Schema { types, key, loc_col }
    }

    pub fn arity(&self) -> usize {
        self.types.len()
    }

    /// Payload slots per tuple allocation.
    pub fn tuple_size(&self) -> usize {
        self.types.len()
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn column_type(&self, i: usize) -> Option<DataType> {
        self.types.get(i).copied()
    }

    pub fn key_columns(&self) -> &[usize] {
        &self.key
    }

    pub fn loc_column(&self) -> Option<usize> {
        self.loc_col
    }
}

struct TupleBuf {
    schema: SchemaRef,
    refcount: Cell<u32>,
    values: RefCell<Vec<Datum>>,
    pool: Weak<PoolShared>,
}

/// Shared handle to a pooled tuple. Cloning the handle does not change the
/// refcount; `pin` and `unpin` do. A handle must not outlive the pins it
/// stands for.
#[derive(Clone)]
pub struct Tuple {
    buf: Rc<TupleBuf>,
}

impl Tuple {
    pub fn schema(&self) -> &SchemaRef {
        &self.buf.schema
    }

    /// Borrow the column values.
    pub fn values(&self) -> Ref<'_, Vec<Datum>> {
        self.buf.values.borrow()
    }

    /// Clone out one column value.
    pub fn get(&self, i: usize) -> Option<Datum> {
        self.buf.values.borrow().get(i).cloned()
    }

    pub fn refcount(&self) -> u32 {
        self.buf.refcount.get()
    }

    /// Take an additional reference on this tuple.
    pub fn pin(&self) -> Tuple {
        let rc = self.buf.refcount.get();
        assert!(rc > 0, "pin of a dead tuple");
        self.buf.refcount.set(rc + 1);
        Tuple { buf: Rc::clone(&self.buf) }
    }

    /// Drop one reference. When the count reaches zero the buffer goes back
    /// onto its pool's free list.
    pub fn unpin(self) {
        let rc = self.buf.refcount.get();
        assert!(rc > 0, "unpin of a dead tuple");
        self.buf.refcount.set(rc - 1);
        if rc == 1 {
            self.buf.values.borrow_mut().clear();
            if let Some(pool) = self.buf.pool.upgrade() {
                pool.free.borrow_mut().push(Rc::clone(&self.buf));
            }
        }
    }

    /// True when both handles point at the same buffer.
    pub fn same_buffer(&self, other: &Tuple) -> bool {
        Rc::ptr_eq(&self.buf, &other.buf)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Tuple) -> bool {
        let a = self.buf.values.borrow();
        let b = other.buf.values.borrow();
        self.buf
            .schema
            .key_columns()
            .iter()
            .all(|&i| a.get(i) == b.get(i))
    }
}

impl Eq for Tuple {}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let vals = self.buf.values.borrow();
        for &i in self.buf.schema.key_columns() {
            vals[i].hash(state);
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.buf.values.borrow().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tuple{self} rc={}", self.refcount())
    }
}

struct PoolShared {
    schema: SchemaRef,
    free: RefCell<Vec<Rc<TupleBuf>>>,
    total: Cell<usize>,
}

/// Per-schema free list of tuple buffers. Allocation grows geometrically;
/// frees push onto the list head so the hottest buffer is reused first.
pub struct TuplePool {
    shared: Rc<PoolShared>,
}

impl TuplePool {
    pub fn new(schema: SchemaRef) -> TuplePool {
        TuplePool {
            shared: Rc::new(PoolShared {
                schema,
                free: RefCell::new(Vec::new()),
                total: Cell::new(0),
            }),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.shared.schema
    }

    /// Buffers ever allocated by this pool.
    pub fn total(&self) -> usize {
        self.shared.total.get()
    }

    /// Buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.shared.free.borrow().len()
    }

    /// Loan a tuple with refcount 1 and an empty payload.
    pub fn loan(&self) -> Tuple {
        if self.shared.free.borrow().is_empty() {
            self.grow();
        }
        let buf = self
            .shared
            .free
            .borrow_mut()
            .pop()
            .expect("pool grew but free list is empty");
        buf.refcount.set(1);
        Tuple { buf }
    }

    /// Loan a tuple and fill its payload in one step.
    pub fn loan_values(&self, values: Vec<Datum>) -> Tuple {
        debug_assert_eq!(values.len(), self.shared.schema.tuple_size());
        let t = self.loan();
        *t.buf.values.borrow_mut() = values;
        t
    }

    fn grow(&self) {
        let total = self.shared.total.get();
        let batch = if total == 0 { INITIAL_POOL_SIZE } else { total };
        let mut free = self.shared.free.borrow_mut();
        free.reserve(batch);
        for _ in 0..batch {
            free.push(Rc::new(TupleBuf {
                schema: Rc::clone(&self.shared.schema),
                refcount: Cell::new(0),
                values: RefCell::new(Vec::with_capacity(self.shared.schema.tuple_size())),
                pool: Rc::downgrade(&self.shared),
            }));
        }
        self.shared.total.set(total + batch);
    }
}
