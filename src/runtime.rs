//! # Engine Runtime
//!
//! Embedding API. `Engine::start` binds the inbound listener, spawns the
//! router thread, and hands back a thread-safe client handle. Clients talk
//! to the engine exclusively through the mailbox; synchronous calls carry a
//! reply channel inside the work item and block on it.
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
//! engine.install_fact("link", vec![Datum::Int32(1), Datum::Int32(2)]).expect("fact installs");
//! let rows = engine.dump_table("path").expect("snapshot");
//! ```

use crate::config::Config;
use crate::error::ProgramError;
use crate::router::{Router, TupleCallback, WorkItem};
use crate::table::Polarity;
use crate::tuple::Tuple;
use crate::value::Datum;
use crate::wire::{Listener, Outbound, TcpOutbound};
use crossbeam_channel::{bounded, Sender};
use std::io;
use std::thread::JoinHandle;

/// Client handle to a running engine instance.
pub struct Engine {
    mailbox: Sender<WorkItem>,
    router_thread: Option<JoinHandle<()>>,
    listener: Option<Listener>,
    port: u16,
    local_addr: String,
}

impl Engine {
    /// Start an engine with the default TCP send shim.
    pub fn start(config: Config) -> io::Result<Engine> {
        Engine::start_with_outbound(config, Box::new(TcpOutbound::new()))
    }

    /// Start an engine dispatching remote derivations through `outbound`.
    pub fn start_with_outbound(config: Config, outbound: Box<dyn Outbound>) -> io::Result<Engine> {
        let (tx, rx) = bounded(config.runtime.mailbox_capacity);

        let inbound_tx = tx.clone();
        let listener = Listener::spawn(&config.network.host, config.network.port, move |fact| {
            if fact.schema_tag != fact.table {
                tracing::warn!(table = %fact.table, tag = %fact.schema_tag,
                    "schema tag does not name the table; tuple rejected");
                return;
            }
            let item = WorkItem::Fact {
                table: fact.table,
                values: fact.values,
                polarity: fact.polarity,
                reply: None,
            };
            if inbound_tx.send(item).is_err() {
                tracing::warn!("inbound tuple arrived after shutdown");
            }
        })?;

        let port = listener.port();
        let local_addr = format!("tcp:{}:{}", config.network.host, port);
        let base_dir = config.resolve_base_dir(port);
        tracing::info!(addr = %local_addr, base_dir = %base_dir.display(), "engine starting");

        let router_addr = local_addr.clone();
        let router_thread = std::thread::Builder::new()
            .name("cascade-router".to_string())
            .spawn(move || {
                Router::new(rx, outbound, router_addr, base_dir).main_loop();
            })?;

        Ok(Engine {
            mailbox: tx,
            router_thread: Some(router_thread),
            listener: Some(listener),
            port,
            local_addr,
        })
    }

    /// The port the inbound listener bound (resolved when 0 was asked for).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// This node's address as peers must spell it in location columns.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Install a program. Errors reject the whole program atomically.
    pub fn install_program(&self, source: &str) -> Result<(), ProgramError> {
        let (reply, response) = bounded(1);
        self.submit(WorkItem::Program { source: source.to_string(), reply })?;
        response.recv().map_err(|_| ProgramError::EngineShutdown)?
    }

    /// Assert one base fact.
    pub fn install_fact(&self, table: &str, values: Vec<Datum>) -> Result<(), ProgramError> {
        self.send_fact(table, values, Polarity::Insert)
    }

    /// Retract one base fact.
    pub fn delete_fact(&self, table: &str, values: Vec<Datum>) -> Result<(), ProgramError> {
        self.send_fact(table, values, Polarity::Delete)
    }

    fn send_fact(
        &self,
        table: &str,
        values: Vec<Datum>,
        polarity: Polarity,
    ) -> Result<(), ProgramError> {
        let (reply, response) = bounded(1);
        self.submit(WorkItem::Fact {
            table: table.to_string(),
            values,
            polarity,
            reply: Some(reply),
        })?;
        response.recv().map_err(|_| ProgramError::EngineShutdown)?
    }

    /// Register a callback invoked on the router thread for every
    /// visibility change of `table`, between work items. The callback must
    /// not block and must not call back into the engine.
    pub fn register_callback(
        &self,
        table: &str,
        callback: impl FnMut(&Tuple, Polarity) + Send + 'static,
    ) -> Result<(), ProgramError> {
        let (reply, response) = bounded(1);
        self.submit(WorkItem::Callback {
            table: table.to_string(),
            callback: Box::new(callback) as TupleCallback,
            reply,
        })?;
        response.recv().map_err(|_| ProgramError::EngineShutdown)?
    }

    /// Snapshot a table's membership, sorted.
    pub fn dump_table(&self, table: &str) -> Result<Vec<Vec<Datum>>, ProgramError> {
        let (reply, response) = bounded(1);
        self.submit(WorkItem::Dump { table: table.to_string(), reply })?;
        response.recv().map_err(|_| ProgramError::EngineShutdown)?
    }

    fn submit(&self, item: WorkItem) -> Result<(), ProgramError> {
        self.mailbox.send(item).map_err(|_| ProgramError::EngineShutdown)
    }

    /// Orderly shutdown: poison the mailbox, join the router, stop the
    /// listener.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.router_thread.take() {
            let _ = self.mailbox.send(WorkItem::Shutdown);
            let _ = handle.join();
        }
        if let Some(mut listener) = self.listener.take() {
            listener.shutdown();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
