#![warn(missing_docs)]

//! krkn: admin CLI for a KrknDB store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use krkndb::{HashRecord, HashType, RecordIter, Store, StoreOptions};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "krkn")]
#[command(about = "KrknDB hash index CLI", long_about = None)]
struct Cli {
    /// Store directory
    #[arg(short, long, env = "KRKN_DIR", default_value = "./krkn-data")]
    dir: PathBuf,

    /// File holding the 32-byte encryption key
    #[arg(short, long, env = "KRKN_KEY_FILE")]
    key_file: PathBuf,

    /// Optional store options file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store one hash and its plaintext
    Store {
        hash: String,
        value: String,
        #[arg(short = 't', long = "type", default_value = "0")]
        hash_type: HashType,
    },
    /// Look up one hash
    Get {
        hash: String,
        #[arg(short = 't', long = "type", default_value = "0")]
        hash_type: HashType,
    },
    /// Find every stored hash from a list in one scan
    Find {
        #[arg(short = 't', long = "type", default_value = "0")]
        hash_type: HashType,
        #[arg(required = true)]
        hashes: Vec<String>,
    },
    /// List records of one type
    List {
        #[arg(short = 't', long = "type", default_value = "0")]
        hash_type: HashType,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Search by normalized SHA-256 prefix
    Search {
        prefix: String,
        #[arg(short = 't', long = "type", default_value = "0")]
        hash_type: HashType,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Rebuild counters from the stored records
    Recount {
        #[arg(short = 't', long = "type")]
        hash_type: Option<HashType>,
    },
    /// Print all counters
    Counts,
    /// Check counters against a recount without modifying them
    Verify,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let key = std::fs::read(&cli.key_file)
        .with_context(|| format!("failed to read key file {}", cli.key_file.display()))?;
    let options = match &cli.config {
        Some(path) => StoreOptions::from_file(path)?,
        None => StoreOptions::default(),
    };

    let store = Store::open_with_options(&cli.dir, &key, options)?;
    let result = run(&store, cli.command);
    store.close()?;
    result
}

fn run(store: &Store, command: Command) -> Result<()> {
    match command {
        Command::Store { hash, value, hash_type } => {
            store.store(&HashRecord::new(hash, value, hash_type))?;
            println!("stored");
        }
        Command::Get { hash, hash_type } => {
            let rec = store.query().get_by_original_hash(&hash, hash_type)?;
            println!("{} -> {}", hash, rec.value());
        }
        Command::Find { hash_type, hashes } => {
            print_records(store.query().find_by_hashes(&hashes, hash_type)?, usize::MAX)?;
        }
        Command::List { hash_type, limit } => {
            print_records(store.query().all_of_type(hash_type)?, limit)?;
        }
        Command::Search { prefix, hash_type, limit } => {
            print_records(store.query().search_by_prefix(&prefix, hash_type)?, limit)?;
        }
        Command::Recount { hash_type } => match hash_type {
            Some(t) => store.counters().recount_hash_type(t)?,
            None => store.counters().perform_recount()?,
        },
        Command::Counts => {
            let counts = store.counters().counts()?;
            for (hash_type, count) in &counts.per_type {
                println!("type {:>6}: {}", hash_type, count);
            }
            println!("total      : {}", counts.total);
        }
        Command::Verify => {
            let counted = store.counters().verify()?;
            println!("counters consistent: {} records", counted.total);
        }
    }
    Ok(())
}

fn print_records(records: RecordIter, limit: usize) -> Result<()> {
    for rec in records.take(limit) {
        let rec = rec?;
        let label = rec.original_hash().unwrap_or(rec.normalized_sum());
        println!("{} -> {}", label, rec.value());
    }
    Ok(())
}
