//! Command line tool for poking at a store.
//!
//! Usage:
//!   tbs_cli <path> put <key> <value>
//!   tbs_cli <path> get <key>
//!   tbs_cli <path> delete <key>
//!   tbs_cli <path> scan [start] [end]
//!   tbs_cli <path> prefix <prefix>
//!   tbs_cli <path> stats
//!   tbs_cli <path> check
//!   tbs_cli <path> dump
//!   tbs_cli <path> bulk-insert <count>
//!
//! Set `RUST_LOG=tiny_block_storage=debug` to watch splits and merges.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use tiny_block_storage::{Config, Result, Store, TreeConfig};
use tracing_subscriber::EnvFilter;

/// Tiny Block Storage CLI
#[derive(Parser, Debug)]
#[command(name = "tbs_cli")]
#[command(about = "Inspect and edit a tiny block storage file")]
struct Args {
    /// Data file; the index is kept alongside it
    path: PathBuf,

    /// Block size used when creating the files
    #[arg(long, default_value_t = 4096)]
    block_size: usize,

    /// Index fanout
    #[arg(long, default_value_t = 64)]
    fanout: usize,

    /// Sync after every write
    #[arg(long)]
    sync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert or update a key-value pair
    Put { key: String, value: String },

    /// Get the value for a key
    Get { key: String },

    /// Delete a key
    Delete { key: String },

    /// List keys in [start, end)
    Scan {
        start: Option<String>,
        end: Option<String>,
    },

    /// List keys starting with a prefix
    Prefix { prefix: String },

    /// Show file and index statistics as JSON
    Stats,

    /// Verify index structure and block accounting
    Check,

    /// Print the index tree as JSON
    Dump,

    /// Insert count generated records
    BulkInsert { count: usize },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("ERROR: {}", e);
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::new(&args.path)
        .block_size(args.block_size)
        .tree_config(TreeConfig::new(args.fanout))
        .sync_on_write(args.sync);
    let store = Store::open(config)?;

    match args.command {
        Commands::Put { key, value } => {
            store.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }

        Commands::Get { key } => match store.get(key.as_bytes())? {
            Some(value) => match String::from_utf8(value) {
                Ok(s) => println!("{}", s),
                Err(_) => println!("<binary data>"),
            },
            None => println!("NOT_FOUND"),
        },

        Commands::Delete { key } => {
            if store.delete(key.as_bytes())? {
                println!("DELETED");
            } else {
                println!("NOT_FOUND");
            }
        }

        Commands::Scan { start, end } => {
            let results = store.range(
                start.as_deref().map(str::as_bytes),
                end.as_deref().map(str::as_bytes),
            )?;
            print_entries(&results);
        }

        Commands::Prefix { prefix } => {
            let results = store.prefix(prefix.as_bytes())?;
            print_entries(&results);
        }

        Commands::Stats => print_json(&store.stats()),

        Commands::Check => {
            let stats = store.verify()?;
            println!(
                "OK: {} entries in {} nodes ({} leaves), height {}",
                stats.entry_count, stats.node_count, stats.leaf_count, stats.height
            );
        }

        Commands::Dump => print_json(&store.snapshot()?),

        Commands::BulkInsert { count } => {
            let start = std::time::Instant::now();
            for i in 0..count {
                let key = format!("key_{:08}", i);
                let value = format!("value_{}", i);
                store.put(key.as_bytes(), value.as_bytes())?;
            }
            store.flush()?;

            let elapsed = start.elapsed();
            println!("Inserted {} records in {:?}", count, elapsed);
            if count > 0 {
                println!("Average: {:?} per insert", elapsed / count as u32);
            }
        }
    }

    Ok(())
}

fn print_entries(entries: &[(Vec<u8>, Vec<u8>)]) {
    println!("COUNT: {}", entries.len());
    for (key, value) in entries {
        println!(
            "{} -> {}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        );
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            exit(1);
        }
    }
}
