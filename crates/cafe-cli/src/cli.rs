//! Argument parsing for the `caf` binary. Covers the full command surface
//! from `spec.md` §6, styled on the teacher's `clap`-derive `Args`/
//! `Subcommand` split in `cli.rs`: one top-level struct with global flags,
//! one enum per command.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::context::DEFAULT_CAFDIR;

#[derive(Parser, Debug)]
#[command(name = "caf", author, about = "Content-addressed task graph engine", long_about = None)]
pub struct Args {
    /// Location of the cellar directory
    #[arg(long, global = true, default_value = DEFAULT_CAFDIR)]
    pub cafdir: Utf8PathBuf,
    /// Resolve against the last submitted queue (see `LAST_QUEUE`)
    #[arg(long, global = true)]
    pub last: bool,
    /// Run against a remote queue URL instead of the local cellar
    #[arg(long, global = true)]
    pub queue: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a fresh `<cafdir>`
    Init,
    /// Read or set a `config.ini` value under `[core]`
    Conf {
        key: String,
        value: Option<String>,
    },
    /// Execute every unfinished task reachable from the current build
    Run {
        /// Glob patterns over virtual task paths; defaults to the whole tree
        #[arg(default_value = "**")]
        patterns: Vec<String>,
        #[arg(long)]
        randomize: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_errors: Option<usize>,
        #[arg(long)]
        cap: Option<usize>,
    },
    /// Traverse without executing — reports what `run` would do
    Make {
        #[arg(default_value = "**")]
        patterns: Vec<String>,
    },
    /// Materialize a build's virtual tree onto the filesystem
    Checkout {
        root: Utf8PathBuf,
        #[arg(default_value = "**")]
        patterns: Vec<String>,
        #[arg(long, default_value_t = 0)]
        nth: i64,
        #[arg(long)]
        finished_only: bool,
        #[arg(long)]
        nolink: bool,
    },
    /// Submit the current build to a remote queue
    Submit {
        remote: String,
    },
    /// Return a task to CLEAN, optionally freeing its stored outputs
    Reset {
        hash: String,
        #[arg(long)]
        hard: bool,
    },
    /// List stored builds, tasks, configured remotes, or profiles
    List {
        #[command(subcommand)]
        what: ListWhat,
    },
    /// Print the state of every task in the current build
    Status,
    /// Prune unreferenced blobs and task rows
    Gc,
    /// Manage configured remotes
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },
    /// Refresh remote task states against the local index
    Update {
        remote: String,
    },
    /// Verify a remote's reported state against the local one
    Check {
        remote: String,
        hash: String,
    },
    /// Pull a finished build back from a remote over SSH/rsync
    Fetch {
        remote: String,
    },
    /// Save an archive of the current cellar
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
    },
    /// Submit, run, and fetch in one step
    Go {
        remote: String,
        #[arg(default_value = "**")]
        patterns: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ListWhat {
    Profiles,
    Remotes,
    Builds,
    Tasks {
        #[arg(long, default_value_t = 0)]
        nth: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum RemoteAction {
    /// Configure an rsync/SSH remote (`remote "NAME"`: `host`, `path`)
    Add { name: String, host: String, path: String },
    /// Configure a queue-announcer endpoint (`queue "NAME"`: `host`, `token`)
    AddQueue { name: String, host: String, token: String },
    Path { name: String },
    List,
}

#[derive(Subcommand, Debug)]
pub enum ArchiveAction {
    Save { dest: Utf8PathBuf },
}
