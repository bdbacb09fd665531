//! Stratify
//!
//! Command-line tools for Strata trees.
//!
//! # Commands
//!
//! - `create` - Create an empty tree
//! - `insert` / `remove` / `get` / `dump` - Work with records
//! - `vivify` - Print the tree structure
//! - `balance` - Run the balancer
//! - `verify` - Read and replay every page
//! - `script` - Run a script of inserts, removals and balances

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata_core::Options;
use strata_storage::checksum_by_name;
use tracing_subscriber::EnvFilter;

/// Strata command-line tools.
#[derive(Parser)]
#[command(name = "stratify")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the tree directory
    #[arg(global = true, short, long)]
    directory: Option<PathBuf>,

    /// Split leaves holding more records than this
    #[arg(global = true, long, default_value_t = 16)]
    leaf_size: usize,

    /// Split branches holding more children than this
    #[arg(global = true, long, default_value_t = 16)]
    branch_size: usize,

    /// Line checksum (none, sha256)
    #[arg(global = true, long, default_value = "none")]
    checksum: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty tree
    Create,

    /// Insert records, replacing records with the same key
    Insert {
        /// Records to insert
        #[arg(required = true)]
        records: Vec<String>,

        /// Skip the balance after inserting
        #[arg(long)]
        no_balance: bool,
    },

    /// Remove records by key
    Remove {
        /// Keys to remove
        #[arg(required = true)]
        keys: Vec<String>,

        /// Skip the balance after removing
        #[arg(long)]
        no_balance: bool,
    },

    /// Print the record with a key
    Get {
        /// Key to look up
        key: String,
    },

    /// Print every record in key order
    Dump,

    /// Print the tree structure
    Vivify {
        /// Print JSON instead of an outline
        #[arg(long)]
        json: bool,
    },

    /// Balance the tree
    Balance,

    /// Read and replay every page
    Verify,

    /// Run a script against a new tree
    Script {
        /// Script file
        file: PathBuf,
    },

    /// Show version information
    Version,
}

fn options(cli: &Cli) -> Result<Options, Box<dyn std::error::Error>> {
    let checksum = checksum_by_name(&cli.checksum)
        .ok_or_else(|| format!("unknown checksum: {}", cli.checksum))?;
    Ok(Options::new()
        .leaf_size(cli.leaf_size)
        .branch_size(cli.branch_size)
        .checksum(checksum))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("Stratify v{}", env!("CARGO_PKG_VERSION"));
        println!("Strata Core v{}", strata_core::VERSION);
        return Ok(());
    }

    let path = cli.directory.clone().ok_or("Tree directory required")?;
    let options = options(&cli)?;

    match cli.command {
        Commands::Create => commands::tree::create(&path, options)?,
        Commands::Insert {
            records,
            no_balance,
        } => commands::records::insert(&path, options, &records, !no_balance)?,
        Commands::Remove { keys, no_balance } => {
            commands::records::remove(&path, options, &keys, !no_balance)?;
        }
        Commands::Get { key } => commands::records::get(&path, options, &key)?,
        Commands::Dump => commands::records::dump(&path, options)?,
        Commands::Vivify { json } => commands::vivify::run(&path, options, json)?,
        Commands::Balance => commands::tree::balance(&path, options)?,
        Commands::Verify => commands::verify::run(&path, &options)?,
        Commands::Script { file } => commands::script::run(&path, options, &file)?,
        Commands::Version => {}
    }

    Ok(())
}
