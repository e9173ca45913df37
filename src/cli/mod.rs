//! Components for the binary command-line interface (§4.F, §6).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

/// Main command-line struct.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(short, long)]
    pub verbose: Option<LevelFilter>,

    /// Live subvolume to process. Repeatable; at least one is required. Each
    /// subvolume's tag (used to name its snapshots) is its basename.
    #[arg(short = 's', long = "subvolume", required = true)]
    pub subvolumes: Vec<PathBuf>,

    /// Delete snapshots older than this from the source repository after a
    /// successful backup, always keeping the newest one (§4.D, §6). Units:
    /// `S,M,H,d,w,m,y` (months = 30 days, years = 365 days).
    #[arg(long)]
    pub keep_for: Option<String>,

    /// Command prefix used to reach a remote host (e.g. `ssh host`), given
    /// as a single space-separated string; must be an absolute path (§6).
    #[arg(long, value_delimiter = ' ')]
    pub remote_cmd: Option<Vec<String>>,

    /// Filter command applied after serialization. Repeatable; each
    /// occurrence is one pipeline stage, given as a single space-separated
    /// argv string; must be an absolute path (§6).
    #[arg(long = "send-filter")]
    pub send_filters: Vec<String>,

    /// Filter command applied before deserialization. Repeatable; same
    /// argv-string convention as `--send-filter` (§6).
    #[arg(long = "recv-filter")]
    pub recv_filters: Vec<String>,

    /// Declares the non-collocated repository (the destination on `backup`,
    /// the source on `restore`, subject to `--reverse`) a file repository
    /// with this extension, rather than a subvolume repository (§6).
    #[arg(long = "snapshot-ext")]
    pub snapshot_ext: Option<String>,

    /// Swap the semantic roles of the two positional repositories, so a
    /// `restore` can be typed with the same positional order as its paired
    /// `backup` (§6).
    #[arg(long)]
    pub reverse: bool,

    /// Don't read stderr from spawned commands (§4.A); required when the
    /// remote command keeps a connection open across invocations (e.g. SSH
    /// with `ControlPersist`).
    #[arg(long)]
    pub no_read_stderr: bool,

    /// Action to perform.
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Action {
    /// Bring the destination repository up to date with the source
    /// repository's live subvolumes.
    Backup(RepoRoots),
    /// Bring the destination repository (the local snapshot archive, or the
    /// live subvolume itself) up to date with the source repository.
    Restore(RestoreArgs),
}

/// The two positional repository roots shared by both subcommands (§6):
/// `<source-repo-root> <destination-repo-root>`.
#[derive(Debug, Args, Clone)]
pub struct RepoRoots {
    /// Source repository root.
    pub source_repo: PathBuf,
    /// Destination repository root.
    pub dest_repo: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub roots: RepoRoots,

    /// Materialize only into the local snapshot repository, rather than
    /// alongside the live subvolume (§6).
    #[arg(long)]
    pub snapshots_only: bool,
}

impl RepoRoots {
    /// Resolves the positional `(source, destination)` pair, honoring
    /// `--reverse` (§6, §4.E design note: "equivalently, with `--reverse`
    /// preserving argv order and swapping them internally").
    pub fn resolve(&self, reverse: bool) -> (&PathBuf, &PathBuf) {
        if reverse {
            (&self.dest_repo, &self.source_repo)
        } else {
            (&self.source_repo, &self.dest_repo)
        }
    }
}
