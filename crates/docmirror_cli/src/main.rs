//! Docmirror CLI
//!
//! Mirrors pickled object state into a JSON document table.
//!
//! # Commands
//!
//! - `update` - Apply source changes to the document table, then follow
//! - `monitor` - Report updater lag with monitoring exit codes
//! - `decode` - Print a stored record as JSON for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Docmirror command-line tools.
#[derive(Parser)]
#[command(name = "docmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(global = true, long, env = "DOCMIRROR_DSN")]
    dsn: Option<String>,

    /// Log level or filter directive
    #[arg(global = true, short, long, default_value = "info")]
    log_level: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply source changes to the document table
    Update {
        /// Change-poll timeout, in seconds
        #[arg(short = 't', long, default_value = "30")]
        poll_timeout: u64,

        /// Approximate transaction size limit, in records
        #[arg(short = 'm', long, default_value = "100000")]
        transaction_size_limit: usize,

        /// Postgres driver
        #[arg(short, long, default_value = "auto", value_parser = ["auto", "postgres"])]
        driver: String,

        /// Remove the legacy delete trigger if present
        #[arg(short = 'T', long)]
        remove_delete_trigger: bool,

        /// Collect garbage and exit
        #[arg(short = 'g', long, conflicts_with = "no_gc")]
        gc_only: bool,

        /// Skip garbage collection on startup
        #[arg(short = 'G', long)]
        no_gc: bool,

        /// Reprocess records through the saved checkpoint, then stop
        #[arg(long)]
        redo: bool,

        /// Checkpoint key
        #[arg(long, default_value = "docmirror.updater")]
        client_id: String,
    },

    /// Report updater lag; exits 0 (OK), 1 (warning) or 2 (error)
    Monitor {
        /// Warning and error thresholds in seconds, as `WARN,ERROR`
        thresholds: String,

        /// Checkpoint key
        #[arg(long, default_value = "docmirror.updater")]
        client_id: String,
    },

    /// Print a stored record's class name and state
    Decode {
        /// File holding the raw record bytes
        file: PathBuf,

        /// The file holds a single pickle instead of a full record
        #[arg(long)]
        pickle: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<u8, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Update {
            poll_timeout,
            transaction_size_limit,
            driver: _,
            remove_delete_trigger,
            gc_only,
            no_gc,
            redo,
            client_id,
        } => {
            let dsn = cli.dsn.ok_or("Connection string required for update")?;
            let options = commands::update::UpdateOptions {
                poll_timeout,
                transaction_size_limit,
                remove_delete_trigger,
                gc_only,
                no_gc,
                redo,
                client_id,
            };
            commands::update::run(&dsn, &options)
        }
        Commands::Monitor {
            thresholds,
            client_id,
        } => {
            let dsn = cli.dsn.ok_or("Connection string required for monitor")?;
            let thresholds = commands::monitor::parse_thresholds(&thresholds)?;
            commands::monitor::run(&dsn, &client_id, thresholds)
        }
        Commands::Decode {
            file,
            pickle,
            format,
        } => {
            commands::decode::run(&file, pickle, &format)?;
            Ok(0)
        }
    }
}
