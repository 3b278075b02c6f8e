//! CLI argument definitions using clap derive

use crate::config::schema::ShimKind;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// blobmemo - Memoized computation over a blob store
///
/// Stores function results under deterministic addresses and coordinates
/// writers with lease locks that need nothing but the store itself.
#[derive(Parser, Debug)]
#[command(name = "blobmemo")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BLOBMEMO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local store directory (overrides store.root)
    #[arg(long, global = true, env = "BLOBMEMO_STORE_ROOT")]
    pub store_root: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Exercise and inspect lease locks
    Lock(LockArgs),

    /// Inspect and manage memoized results
    Memo(MemoArgs),

    /// Call a built-in function through the memoizing runner
    Call(CallArgs),

    /// Compute one recorded invocation (used by the subprocess shim)
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the lock command
#[derive(Parser, Debug)]
pub struct LockArgs {
    #[command(subcommand)]
    pub action: LockAction,
}

/// Lease parameters shared by lock subcommands
#[derive(Parser, Debug, Clone)]
pub struct LeaseArgs {
    /// Lease duration in seconds (default: lock.expire_secs)
    #[arg(long)]
    pub expire_secs: Option<f64>,

    /// Acquire margin in seconds (default: lock.acquire_margin_secs)
    #[arg(long)]
    pub margin_secs: Option<f64>,
}

/// Lock actions
#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// Run N competing processes against one lock and check for overlap
    Stress {
        /// Number of worker processes
        #[arg(short = 'n', long, default_value = "4")]
        processes: usize,

        /// How long each worker keeps competing
        #[arg(short, long, default_value = "10")]
        duration_secs: u64,

        /// How long each acquisition is held
        #[arg(long, default_value = "50")]
        hold_ms: u64,

        /// Directory for per-worker window files
        #[arg(short, long)]
        out: PathBuf,

        /// Lock address under the store
        #[arg(short, long, default_value = "locks/stress")]
        lock: String,

        #[command(flatten)]
        lease: LeaseArgs,
    },

    /// Repeatedly acquire, hold and release one lock, recording each window
    #[command(hide = true)]
    Worker {
        /// Lock address under the store
        #[arg(short, long)]
        lock: String,

        #[arg(short, long)]
        duration_secs: u64,

        #[arg(long)]
        hold_ms: u64,

        /// JSON lines file receiving one window per acquisition
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        lease: LeaseArgs,
    },

    /// Check recorded windows for overlap
    Verify {
        /// Directory of window files
        dir: PathBuf,
    },

    /// Print the lock record at an address
    Show {
        /// Lock address under the store
        address: String,
    },
}

/// Arguments for the memo command
#[derive(Parser, Debug)]
pub struct MemoArgs {
    #[command(subcommand)]
    pub action: MemoAction,
}

/// Memo actions
#[derive(Subcommand, Debug)]
pub enum MemoAction {
    /// Show the control files recorded at an address
    Inspect {
        /// Memospace address
        address: String,

        /// Print the result or exception payload
        #[arg(long)]
        payload: bool,
    },

    /// Delete the control files at an address
    Invalidate {
        /// Memospace address
        address: String,
    },

    /// List entries under a prefix
    List {
        /// Prefix under the store (default: memo.root)
        prefix: Option<String>,
    },

    /// Drop every negative cache entry
    ClearNegative,
}

/// Arguments for the call command
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Function name (e.g. demo::square)
    pub function: String,

    /// Positional arguments, parsed as JSON when possible
    pub args: Vec<String>,

    /// Keyword argument as KEY=VALUE (repeatable)
    #[arg(short, long = "kwarg", value_name = "KEY=VALUE")]
    pub kwargs: Vec<String>,

    /// Pipeline id (default: memo.pipeline_id)
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Execution shim (default: shim.kind)
    #[arg(long, value_enum)]
    pub shim: Option<ShimChoice>,

    /// Hold the lease lock on the address while computing
    #[arg(long)]
    pub lock: bool,
}

/// Shim selection on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShimChoice {
    Thread,
    Subprocess,
}

impl From<ShimChoice> for ShimKind {
    fn from(choice: ShimChoice) -> Self {
        match choice {
            ShimChoice::Thread => ShimKind::Thread,
            ShimChoice::Subprocess => ShimKind::Subprocess,
        }
    }
}

/// Arguments for the worker command
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Address uri of the recorded invocation
    #[arg(env = "BLOBMEMO_ADDRESS")]
    pub address: String,

    /// Hold the lease lock on nested calls
    #[arg(long)]
    pub lock: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., memo.pipeline_id)
        key: String,

        /// Value to set
        value: String,
    },
}
