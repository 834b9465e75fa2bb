//! # Cascade Shell
//!
//! Interactive shell around a single engine instance. Statements are
//! buffered until a terminating `;` and installed as a program; meta
//! commands start with a backslash:
//!
//! ```text
//! cascade> define link(int, int);
//! cascade> link(1, 2);
//! cascade> \dump link
//! (1, 2)
//! cascade> \quit
//! ```

use anyhow::Context;
use cascade::{Config, Engine};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cascade", about = "Deductive database engine shell", version)]
struct Args {
    /// Inbound listen port (0 selects an ephemeral port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// On-disk state root for durable tables
    #[arg(long)]
    base_dir: Option<std::path::PathBuf>,

    /// Program file to install before the prompt appears
    #[arg(long)]
    load: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).context("loading configuration")?,
        None => Config::load().unwrap_or_default(),
    };
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(dir) = args.base_dir {
        config.storage.base_dir = Some(dir);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let engine = Engine::start(config).context("starting engine")?;
    println!("cascade listening on {}", engine.local_addr());

    if let Some(path) = &args.load {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        engine
            .install_program(&source)
            .with_context(|| format!("installing {}", path.display()))?;
        println!("loaded {}", path.display());
    }

    let mut editor = DefaultEditor::new()?;
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { "cascade> " } else { "      -> " };
        match editor.readline(prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if buffer.is_empty() && line.starts_with('\\') {
                    let _ = editor.add_history_entry(line);
                    if !meta_command(&engine, line) {
                        break;
                    }
                    continue;
                }

                buffer.push_str(line);
                buffer.push('\n');
                if !line.ends_with(';') {
                    continue;
                }

                let statement = std::mem::take(&mut buffer);
                let _ = editor.add_history_entry(statement.trim());
                if let Err(e) = engine.install_program(&statement) {
                    eprintln!("error: {e}");
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}

/// Handle a backslash command; false means quit.
fn meta_command(engine: &Engine, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("\\quit") | Some("\\q") => return false,
        Some("\\dump") => match parts.next() {
            Some(table) => match engine.dump_table(table) {
                Ok(rows) => {
                    for row in rows {
                        let cols: Vec<String> = row.iter().map(ToString::to_string).collect();
                        println!("({})", cols.join(", "));
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            },
            None => eprintln!("usage: \\dump <table>"),
        },
        Some("\\watch") => match parts.next() {
            Some(table) => {
                let name = table.to_string();
                let result = engine.register_callback(table, move |tuple, polarity| {
                    let sign = match polarity {
                        cascade::Polarity::Insert => '+',
                        cascade::Polarity::Delete => '-',
                    };
                    println!("{sign}{name}{tuple}");
                });
                match result {
                    Ok(()) => println!("watching {table}"),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            None => eprintln!("usage: \\watch <table>"),
        },
        Some("\\addr") => println!("{}", engine.local_addr()),
        Some("\\help") => {
            println!("  <statement>;      install defines, facts, and rules");
            println!("  \\dump <table>     print a table's membership");
            println!("  \\watch <table>    print every visibility change");
            println!("  \\addr             print this node's address");
            println!("  \\quit             exit");
        }
        _ => eprintln!("unknown command; try \\help"),
    }
    true
}
