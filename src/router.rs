//! # Router
//!
//! The single-threaded heart of the engine. External producers deposit work
//! items into the mailbox; the router drains it in FIFO order until a
//! poison item arrives. Each tuple work item is installed into (or deleted
//! from) its table's refcounted multiset; a visibility change fires every
//! operator chain keyed by that table, and the derivations land back in the
//! per-tick pending queue, which is fully drained before the next external
//! item (per-tick fixpoint).
//!
//! All engine state lives on this thread. The mailbox is the only
//! cross-thread object.

use crate::analyze::{self, DepEdge};
use crate::catalog::Catalog;
use crate::error::ProgramError;
use crate::operator::{Derivation, OpChain};
use crate::parser;
use crate::plan;
use crate::table::{DeleteOutcome, Polarity, Table, Tables};
use crate::tuple::Tuple;
use crate::value::Datum;
use crate::wire::{self, Outbound};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

/// Per-table callback, invoked on the router thread between work items.
pub type TupleCallback = Box<dyn FnMut(&Tuple, Polarity) + Send>;

/// Unit of work deposited into the mailbox.
pub enum WorkItem {
    /// A tuple bound for a table. `reply` is present for client-submitted
    /// facts and absent for network-delivered ones.
    Fact {
        table: String,
        values: Vec<Datum>,
        polarity: Polarity,
        reply: Option<Sender<Result<(), ProgramError>>>,
    },
    /// Install a program; the result goes back synchronously.
    Program { source: String, reply: Sender<Result<(), ProgramError>> },
    /// Register a table callback.
    Callback {
        table: String,
        callback: TupleCallback,
        reply: Sender<Result<(), ProgramError>>,
    },
    /// Snapshot a table's membership.
    Dump { table: String, reply: Sender<Result<Vec<Vec<Datum>>, ProgramError>> },
    /// Poison: exit the main loop.
    Shutdown,
}

#[derive(Debug)]
struct Pending {
    table: String,
    tuple: Tuple,
    polarity: Polarity,
}

pub struct Router {
    mailbox: Receiver<WorkItem>,
    catalog: Catalog,
    tables: Tables,
    /// Chains indexed by their delta table.
    chains: HashMap<String, Vec<OpChain>>,
    dep_edges: Vec<DepEdge>,
    pending: VecDeque<Pending>,
    callbacks: HashMap<String, Vec<TupleCallback>>,
    outbound: Box<dyn Outbound>,
    local_addr: String,
    base_dir: PathBuf,
}

impl Router {
    pub fn new(
        mailbox: Receiver<WorkItem>,
        outbound: Box<dyn Outbound>,
        local_addr: String,
        base_dir: PathBuf,
    ) -> Router {
        Router {
            mailbox,
            catalog: Catalog::new(),
            tables: Tables::new(),
            chains: HashMap::new(),
            dep_edges: Vec::new(),
            pending: VecDeque::new(),
            callbacks: HashMap::new(),
            outbound,
            local_addr,
            base_dir,
        }
    }

    /// Block on the mailbox and process work until shutdown.
    pub fn main_loop(&mut self) {
        loop {
            let Ok(first) = self.mailbox.recv() else {
                // Every producer handle is gone.
                return;
            };
            let mut batch = vec![first];
            while let Ok(item) = self.mailbox.try_recv() {
                batch.push(item);
            }
            for item in batch {
                if !self.handle(item) {
                    return;
                }
            }
        }
    }

    /// Process one work item; false means shutdown.
    fn handle(&mut self, item: WorkItem) -> bool {
        match item {
            WorkItem::Shutdown => {
                tracing::info!("router shutting down");
                false
            }
            WorkItem::Program { source, reply } => {
                let result = self.install_program(&source);
                if let Err(e) = &result {
                    tracing::info!(error = %e, "program rejected");
                }
                let _ = reply.send(result);
                true
            }
            WorkItem::Fact { table, values, polarity, reply } => {
                match self.make_fact(&table, values, polarity) {
                    Ok(pending) => {
                        // Facts obey location specifiers exactly like
                        // derivations do.
                        self.route(Derivation {
                            table: pending.table,
                            tuple: pending.tuple,
                            polarity: pending.polarity,
                        });
                        self.drain_pending();
                        if let Some(tx) = reply {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        if let Some(tx) = reply {
                            let _ = tx.send(Err(e));
                        } else {
                            tracing::warn!(table, error = %e, "rejected inbound tuple");
                        }
                    }
                }
                true
            }
            WorkItem::Callback { table, callback, reply } => {
                let result = if self.catalog.contains(&table) {
                    self.callbacks.entry(table).or_default().push(callback);
                    Ok(())
                } else {
                    Err(ProgramError::UnknownTable(table))
                };
                let _ = reply.send(result);
                true
            }
            WorkItem::Dump { table, reply } => {
                let result = self
                    .tables
                    .get(&table)
                    .map(Table::snapshot)
                    .ok_or(ProgramError::UnknownTable(table));
                let _ = reply.send(result);
                true
            }
        }
    }

    /// Parse, analyze, and plan, then commit: definitions into the catalog,
    /// tables, chains, and finally the program's base facts as ordinary
    /// work. Nothing is committed on error.
    fn install_program(&mut self, source: &str) -> Result<(), ProgramError> {
        let ast = parser::parse_program(source)?;
        let analyzed = analyze::analyze(&ast, &self.catalog, &self.dep_edges)?;
        let chains = plan::plan_rules(&analyzed.rules)?;

        // Durable opens can fail; build every table before committing.
        let mut new_tables = Vec::with_capacity(analyzed.defines.len());
        for def in &analyzed.defines {
            new_tables.push(Table::create(Rc::clone(def), &self.base_dir)?);
        }

        for def in analyzed.defines {
            self.catalog.define(def)?;
        }
        for table in new_tables {
            self.tables.insert(table);
        }
        self.dep_edges.extend(analyzed.edges);
        for chain in chains {
            self.chains.entry(chain.delta_table.clone()).or_default().push(chain);
        }

        for fact in analyzed.facts {
            if let Some(table) = self.tables.get(&fact.table) {
                let tuple = table.pool().loan_values(fact.values);
                self.route(Derivation {
                    table: fact.table,
                    tuple,
                    polarity: Polarity::Insert,
                });
            }
        }
        self.drain_pending();
        Ok(())
    }

    /// Validate a fact against the catalog and loan its tuple.
    fn make_fact(
        &self,
        table: &str,
        values: Vec<Datum>,
        polarity: Polarity,
    ) -> Result<Pending, ProgramError> {
        let def = self
            .catalog
            .get(table)
            .ok_or_else(|| ProgramError::UnknownTable(table.to_string()))?;
        if values.len() != def.arity() {
            return Err(ProgramError::ArityMismatch {
                table: table.to_string(),
                expected: def.arity(),
                got: values.len(),
            });
        }
        for (i, v) in values.iter().enumerate() {
            if Some(v.data_type()) != def.schema.column_type(i) {
                return Err(ProgramError::TypeMismatch(format!(
                    "column {i} of {table} is {:?}, got {}",
                    def.schema.column_type(i),
                    v.data_type()
                )));
            }
        }
        let live = self
            .tables
            .get(table)
            .ok_or_else(|| ProgramError::UnknownTable(table.to_string()))?;
        Ok(Pending {
            table: table.to_string(),
            tuple: live.pool().loan_values(values),
            polarity,
        })
    }

    /// Drain the per-tick queue to fixpoint. Derivations produced while
    /// processing are appended and processed in arrival order.
    fn drain_pending(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            match item.polarity {
                Polarity::Insert => self.install_tuple(&item.table, item.tuple),
                Polarity::Delete => self.delete_tuple(&item.table, item.tuple),
            }
        }
    }

    /// Record one derivation of `tuple`. Chains fire only when the tuple
    /// just became visible (semi-naive).
    fn install_tuple(&mut self, table: &str, tuple: Tuple) {
        let Some(live) = self.tables.get_mut(table) else {
            tracing::warn!(table, "install into unknown table");
            tuple.unpin();
            return;
        };
        let was_new = live.insert(&tuple);
        if was_new {
            tracing::debug!(table, tuple = %tuple, "+");
            self.fire_chains(table, &tuple, Polarity::Insert);
            self.notify(table, &tuple, Polarity::Insert);
        }
        tuple.unpin();
    }

    /// Retract one derivation. Chains fire only when the count reaches
    /// zero, with the canonical stored tuple as the driver.
    fn delete_tuple(&mut self, table: &str, probe: Tuple) {
        let Some(live) = self.tables.get_mut(table) else {
            tracing::warn!(table, "delete from unknown table");
            probe.unpin();
            return;
        };
        match live.delete(&probe) {
            DeleteOutcome::Removed(canonical) => {
                tracing::debug!(table, tuple = %canonical, "-");
                self.fire_chains(table, &canonical, Polarity::Delete);
                self.notify(table, &canonical, Polarity::Delete);
                canonical.unpin();
            }
            DeleteOutcome::Counted(_) => {}
            DeleteOutcome::Absent => {
                tracing::warn!(table, tuple = %probe, "deletion of a tuple that is not present");
            }
        }
        probe.unpin();
    }

    /// Run every chain whose delta driver is `table`, then route what they
    /// derived.
    fn fire_chains(&mut self, table: &str, driver: &Tuple, polarity: Polarity) {
        let mut out: Vec<Derivation> = Vec::new();
        if let Some(chains) = self.chains.get(table) {
            for chain in chains {
                if !chain.accepts(polarity) {
                    continue;
                }
                let pin = driver.pin();
                chain.fire(&pin, polarity, &self.tables, &mut out);
                pin.unpin();
            }
        }
        for derivation in out {
            self.route(derivation);
        }
    }

    /// Local derivations join the pending queue; derivations whose location
    /// column names another node go to the send shim instead.
    fn route(&mut self, d: Derivation) {
        let Some(loc_col) = self.catalog.get(&d.table).map(|def| def.schema.loc_column()) else {
            tracing::warn!(table = %d.table, "derivation for unknown table");
            d.tuple.unpin();
            return;
        };

        if let Some(col) = loc_col {
            if let Some(Datum::String(addr)) = d.tuple.get(col) {
                if addr.as_ref() != self.local_addr {
                    let body = wire::encode_fact(&d.table, d.polarity, &d.tuple.values());
                    if let Err(e) = self.outbound.send(&addr, &body) {
                        tracing::warn!(table = %d.table, addr = %addr, error = %e,
                            "remote send failed; derivation lost");
                    }
                    d.tuple.unpin();
                    return;
                }
            }
        }

        self.pending.push_back(Pending { table: d.table, tuple: d.tuple, polarity: d.polarity });
    }

    fn notify(&mut self, table: &str, tuple: &Tuple, polarity: Polarity) {
        if let Some(callbacks) = self.callbacks.get_mut(table) {
            for cb in callbacks.iter_mut() {
                cb(tuple, polarity);
            }
        }
    }
}
