//! Incremental btrfs snapshot backup/restore, by composing `btrfs send`,
//! `btrfs receive`, and user-supplied filter commands into a single piped
//! external-process pipeline (§1 overview).
//!
//! [`cli`] is the command-line surface; [`run`] is the orchestration entry
//! point main.rs calls after parsing it. The core types are [`repository`]
//! (snapshot discovery, naming, retention), [`pipeline`] (process
//! composition and teardown), [`filterspec`] (validated filter chains), and
//! [`sync`] (the per-subvolume transfer algorithm shared by backup and
//! restore).

#![forbid(unsafe_code)]

pub mod cli;
pub mod duration;
pub mod error;
pub mod exec;
pub mod filterspec;
pub mod pipeline;
pub mod repository;
pub mod snapshot;
pub mod sync;

use std::path::Path;

use chrono::Utc;

use cli::{Action, Cli};
use error::{ConfigError, Error};
use exec::StderrMode;
use filterspec::{FilterRole, FilterSpec};
use repository::{Repository, RepositoryError, RepositoryKind, Subvolume};
use sync::{SyncError, SyncOutcome};

/// One subvolume's result: `Ok` even when the transfer failed, since a
/// per-subvolume transfer failure isn't fatal to the run (§7); only `Err`
/// when the repository-level step around the transfer itself failed (e.g.
/// listing a directory, creating a snapshot).
pub type SubvolumeResult = Result<SyncOutcome, SyncError>;

/// Runs the action `cli` selects for every `--subvolume`, returning one
/// result per subvolume in the order given. Returns `Err` only for
/// configuration problems that make the whole invocation impossible to
/// carry out (§7); those are checked before anything is spawned.
pub fn run(cli: &Cli) -> Result<Vec<(Subvolume, SubvolumeResult)>, Error> {
    if cli.subvolumes.is_empty() {
        return Err(ConfigError::NoSubvolumes.into());
    }

    if let Some(remote_cmd) = &cli.remote_cmd {
        if let Some(program) = remote_cmd.first() {
            if !Path::new(program).is_absolute() {
                return Err(ConfigError::RemoteCmdNotAbsolute { program: program.clone() }.into());
            }
        }
    }

    let keep_for = cli
        .keep_for
        .as_deref()
        .map(duration::parse_duration)
        .transpose()
        .map_err(ConfigError::from)?;

    let send_filters = FilterSpec::new(split_filter_args(&cli.send_filters), FilterRole::Send)?;
    let recv_filters = FilterSpec::new(split_filter_args(&cli.recv_filters), FilterRole::Recv)?;

    let stderr_mode = StderrMode::Capture.effective(cli.no_read_stderr);
    let non_local_kind = repo_kind(&cli.snapshot_ext);

    // The non-collocated repository's extension policy (§6 `--snapshot-ext`)
    // requires a filter carrying the `{file}` token on whichever filter
    // chain touches that side of the transfer — §4.B: "If the extension
    // policy requires a file repo and no filter contains `{file}`, pipeline
    // construction fails with a configuration error." This is a
    // configuration error (§7) and so is checked upfront, before any
    // snapshot is created or repository is touched, rather than deferred to
    // `sync::sync` per subvolume.
    if matches!(non_local_kind, RepositoryKind::File { .. }) {
        let required_filters = match &cli.action {
            Action::Backup(_) => &recv_filters,
            Action::Restore(_) => &send_filters,
        };
        if !required_filters.contains_file_token() {
            return Err(ConfigError::MissingFileToken.into());
        }
    }

    let results = match &cli.action {
        Action::Backup(roots) => {
            // Unreversed: first positional is the source (the local,
            // collocated snapshot archive), second is the destination (§6).
            let (source_root, dest_root) = roots.resolve(cli.reverse);
            let source_repo = Repository::local(source_root, RepositoryKind::Subvolume);
            let dest_repo = remote_aware_repo(dest_root, non_local_kind, cli.remote_cmd.as_deref());

            cli.subvolumes
                .iter()
                .map(|path| {
                    let subvolume = Subvolume::new(path.clone());
                    let outcome = run_backup(&source_repo, &dest_repo, &subvolume, &send_filters, &recv_filters, stderr_mode, keep_for);
                    (subvolume, outcome)
                })
                .collect()
        }
        Action::Restore(args) => {
            // Unreversed: first positional is the source (the remote/file
            // backup archive), second is the destination (the local
            // collocated snapshot archive) — the mirror image of `backup`
            // (§4.E). `--reverse` lets the operator type the same positional
            // order as the paired `backup` invocation (§6).
            let (source_root, dest_root) = args.roots.resolve(cli.reverse);
            let source_repo = remote_aware_repo(source_root, non_local_kind, cli.remote_cmd.as_deref());

            cli.subvolumes
                .iter()
                .map(|path| {
                    let subvolume = Subvolume::new(path.clone());
                    let dest_repo = restore_dest_repo(&subvolume, dest_root, args.snapshots_only);
                    let outcome = run_restore(&source_repo, &dest_repo, &subvolume, &send_filters, &recv_filters, stderr_mode);
                    (subvolume, outcome)
                })
                .collect()
        }
    };

    Ok(results)
}

fn repo_kind(extension: &Option<String>) -> RepositoryKind {
    match extension {
        Some(ext) => RepositoryKind::File { extension: ext.clone() },
        None => RepositoryKind::Subvolume,
    }
}

fn remote_aware_repo(root: &Path, kind: RepositoryKind, remote_cmd: Option<&[String]>) -> Repository {
    match remote_cmd {
        Some(cmd) => Repository::remote(root, cmd.to_vec(), kind),
        None => Repository::local(root, kind),
    }
}

/// The restore destination for one subvolume: the local snapshot archive
/// rooted at `dest_root` when `--snapshots-only`, otherwise the directory
/// the live subvolume itself lives in — `btrfs receive` there materializes
/// the restored snapshot alongside it, named per the stream (§4.D, §4.E).
fn restore_dest_repo(subvolume: &Subvolume, dest_root: &Path, snapshots_only: bool) -> Repository {
    if snapshots_only {
        return Repository::local(dest_root, RepositoryKind::Subvolume);
    }
    let parent = subvolume.path().parent().unwrap_or_else(|| Path::new("/"));
    Repository::local(parent, RepositoryKind::Subvolume)
}

/// Splits each `--send-filter`/`--recv-filter` occurrence on whitespace into
/// its own argv. There's no quoting support; a filter program whose
/// arguments need embedded spaces isn't expressible this way.
fn split_filter_args(raw: &[String]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|stage| stage.split_whitespace().map(str::to_string).collect())
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn run_backup(
    snapshot_repo: &Repository,
    dest_repo: &Repository,
    subvolume: &Subvolume,
    send_filters: &FilterSpec,
    recv_filters: &FilterSpec,
    stderr_mode: StderrMode,
    keep_for: Option<std::time::Duration>,
) -> SubvolumeResult {
    let tag = subvolume.tag();
    let child = snapshot_repo.snapshot(subvolume)?;
    let outcome = sync::sync(snapshot_repo, dest_repo, &tag, &child, send_filters, recv_filters, stderr_mode)?;

    if outcome.is_success() {
        if let Some(keep_for) = keep_for {
            snapshot_repo.purge(&tag, keep_for, Utc::now())?;
        }
    }
    Ok(outcome)
}

fn run_restore(
    source_repo: &Repository,
    dest_repo: &Repository,
    subvolume: &Subvolume,
    send_filters: &FilterSpec,
    recv_filters: &FilterSpec,
    stderr_mode: StderrMode,
) -> SubvolumeResult {
    let tag = subvolume.tag();
    let child = source_repo
        .latest(&tag)?
        .ok_or_else(|| RepositoryError::NoSnapshots { tag: tag.clone() })?;
    let outcome = sync::sync(source_repo, dest_repo, &tag, &child, send_filters, recv_filters, stderr_mode)?;
    Ok(outcome)
}

/// True iff every subvolume's result succeeded (neither an `Err` nor a
/// [`SyncOutcome::Failed`]) — used to pick the process exit code (§6).
pub fn all_succeeded(results: &[(Subvolume, SubvolumeResult)]) -> bool {
    results.iter().all(|(_, r)| matches!(r, Ok(outcome) if outcome.is_success()))
}
