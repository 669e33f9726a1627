//! Blueprint Sync Command-Line Driver
//!
//! Runs the sync engine offline over JSON snapshot files.

mod commands;
mod formatter;

use clap::{Args as ClapArgs, Parser, Subcommand};
use formatter::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Blueprint Sync Command-Line Driver
#[derive(Parser, Debug)]
#[command(name = "bpsync")]
#[command(version, about = "Dependency-ordered blueprint and record sync")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Output format
    #[arg(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,

    /// Verbose logging and full error listings
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show what an apply would do, without writing anything
    Plan {
        #[command(flatten)]
        files: SyncFiles,
        #[command(flatten)]
        sync: SyncFlags,
    },

    /// Apply the desired state onto the current state
    Apply {
        #[command(flatten)]
        files: SyncFiles,
        #[command(flatten)]
        sync: SyncFlags,

        /// Where to write the resulting state
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare two snapshots, read-only
    Compare {
        /// Source snapshot
        #[arg(long)]
        source: PathBuf,

        /// Target snapshot
        #[arg(long)]
        target: PathBuf,

        /// Kinds to compare (comma separated, e.g. blueprints,teams)
        #[arg(long, value_delimiter = ',')]
        include: Vec<bpsync_core::ResourceKind>,

        /// Exit with status 1 when the snapshots differ
        #[arg(long)]
        fail_on_diff: bool,
    },
}

/// Snapshot files for plan/apply.
#[derive(ClapArgs, Debug)]
pub struct SyncFiles {
    /// Desired state snapshot
    #[arg(long)]
    pub desired: PathBuf,

    /// Current state snapshot (an empty target when omitted)
    #[arg(long)]
    pub current: Option<PathBuf>,
}

/// Engine tuning shared by plan/apply.
#[derive(ClapArgs, Debug)]
pub struct SyncFlags {
    /// Kinds that participate (comma separated, e.g. blueprints,entities)
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<bpsync_core::ResourceKind>,

    /// Leave data records alone
    #[arg(long)]
    pub skip_entities: bool,

    /// Concurrent schema writes
    #[arg(long, default_value_t = bpsync_core::config::SCHEMA_CONCURRENCY)]
    pub schema_concurrency: usize,

    /// Concurrent record writes
    #[arg(long, default_value_t = bpsync_core::config::RECORD_CONCURRENCY)]
    pub record_concurrency: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { "bpsync=debug" } else { "bpsync=info" };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(level),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let format = args.format;
    let verbose = args.verbose;

    match args.command {
        Command::Plan { files, sync } => commands::plan(&files, &sync, format).await,
        Command::Apply {
            files,
            sync,
            output,
        } => commands::apply(&files, &sync, output.as_deref(), format, verbose).await,
        Command::Compare {
            source,
            target,
            include,
            fail_on_diff,
        } => commands::compare(&source, &target, &include, fail_on_diff, format, verbose),
    }
}
