//! snapdecode: inspect kernel bookkeeping structures in a memory snapshot
//!
//! ## Commands
//!
//! - **mutex / semaphore / rwsem**: owner, waiters and call stacks of locks
//! - **workqueues**: every workqueue and worker pool
//! - **workqueue**: one workqueue by name
//! - **pool**: one worker pool by id
//! - **idr**: dump or query a `struct idr` registry
//!
//! ## Example Usage
//!
//! ```bash
//! # Who holds this mutex, and who is waiting?
//! snapdecode --image vmcore.json mutex 0xffff888003a1c0a8
//!
//! # Stacks of every task blocked on an rwsem
//! snapdecode --image vmcore.json rwsem 0xffff888003a1c200 --waiter-callstack
//!
//! # All busy workqueues, as JSON
//! snapdecode --image vmcore.json --json workqueues
//!
//! # Which pool is registered under id 4?
//! snapdecode --image vmcore.json idr worker_pool_idr --id 4
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use snapdecode_core::LockKind;
use tracing_subscriber::EnvFilter;

mod snapdecode_cli;

use snapdecode_cli::{
    index::IdrCmd,
    locks::LockCmd,
    output::format_error,
    queues::{PoolCmd, WorkqueueCmd, WorkqueuesCmd},
    Session,
};

#[derive(Parser)]
#[command(
    name = "snapdecode",
    author,
    version,
    about = "Decode locks, work queues and ID registries from a memory snapshot"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Snapshot image (JSON)
    #[arg(long, global = true, env = "SNAPDECODE_IMAGE")]
    image: Option<PathBuf>,

    /// Decoder config (JSON); overrides SNAPDECODE_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (debug logging)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect mutexes
    Mutex(LockCmd),

    /// Inspect counting semaphores
    Semaphore(LockCmd),

    /// Inspect read-write semaphores
    Rwsem(LockCmd),

    /// Dump every workqueue and worker pool
    Workqueues(WorkqueuesCmd),

    /// Dump one workqueue by name
    Workqueue(WorkqueueCmd),

    /// Dump one worker pool by id
    Pool(PoolCmd),

    /// Dump or query an ID registry
    Idr(IdrCmd),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<()> {
    let image = cli
        .image
        .ok_or_else(|| anyhow::anyhow!("no snapshot image given (use --image or SNAPDECODE_IMAGE)"))?;
    let session = Session::load(&image, cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Mutex(cmd) => cmd.execute(&session, LockKind::Mutex, json),
        Commands::Semaphore(cmd) => cmd.execute(&session, LockKind::Semaphore, json),
        Commands::Rwsem(cmd) => cmd.execute(&session, LockKind::RwSemaphore, json),
        Commands::Workqueues(cmd) => cmd.execute(&session, json),
        Commands::Workqueue(cmd) => cmd.execute(&session, json),
        Commands::Pool(cmd) => cmd.execute(&session, json),
        Commands::Idr(cmd) => cmd.execute(&session, json),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;

    if let Err(err) = run(cli) {
        eprint!("{}", format_error(&err, json));
        if json {
            eprintln!();
        }
        std::process::exit(1);
    }
}
