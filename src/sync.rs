//! Sync engine (§4.E): the core "bring `dest` up to date with `source` for
//! one subvolume" operation. Backup and restore are the same algorithm with
//! `source`/`dest` swapped by the caller (§4.E design note); this module has
//! no notion of which direction it's running in.

use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::error::ConfigError;
use crate::exec::StderrMode;
use crate::filterspec::FilterSpec;
use crate::pipeline::{self, Pipeline, PipelineError, RawStage};
use crate::repository::{ReceiveStage, Repository, RepositoryError, SendStage};
use crate::snapshot::Snapshot;

#[derive(Debug, Display, Error, From)]
pub enum SyncError {
    #[from]
    Repository(RepositoryError),
    #[from]
    Config(ConfigError),
    #[from]
    Pipeline(PipelineError),
}

/// The result of one `sync` call for one subvolume (§4.E, §7): transfer
/// failures are reported here rather than propagated, so sibling subvolumes
/// keep running.
#[derive(Debug)]
pub enum SyncOutcome {
    /// `dest` already had the snapshot `source` would have sent.
    NoOp,
    /// The snapshot was sent and received successfully.
    Transferred { snapshot_name: String },
    /// The pipeline ran but at least one stage exited non-zero.
    Failed {
        snapshot_name: String,
        argv: Vec<String>,
        exit_code: i32,
        stderr: Option<String>,
    },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::Failed { .. })
    }
}

/// Brings `dest` up to date with `source` for the already-selected snapshot
/// `child` of `tag` (§4.E):
///
/// 1. The common parent — the newest snapshot present, by exact name, in
///    both repositories — is found, if any.
/// 2. If `dest` already holds `child`, nothing is sent.
/// 3. Otherwise a `send | filters... | filters... | receive` pipeline is
///    built and run.
///
/// Selecting `child` (a fresh live-subvolume snapshot for a backup, or the
/// latest existing snapshot for a restore) and any retention purge
/// afterwards are the caller's responsibility (§4.E design note): this
/// function only knows how to move one named snapshot from `source` to
/// `dest`, which is what lets backup and restore share it unchanged with
/// `source`/`dest` swapped.
pub fn sync(
    source: &Repository,
    dest: &Repository,
    tag: &str,
    child: &Snapshot,
    send_filters: &FilterSpec,
    recv_filters: &FilterSpec,
    stderr_mode: StderrMode,
) -> Result<SyncOutcome, SyncError> {
    let source_list = source.list(tag)?;
    let dest_list = dest.list(tag)?;

    if dest_list.iter().any(|s| s.name() == child.name()) {
        return Ok(SyncOutcome::NoOp);
    }

    let parent = common_parent(&source_list, &dest_list);

    let mut stages = build_source_stages(source, child, parent.as_ref(), send_filters)?;
    stages.extend(build_dest_stages(dest, child, recv_filters)?);

    let remote_cmd = source.remote_cmd().or_else(|| dest.remote_cmd());
    let pipeline = Pipeline::build(stages, remote_cmd, stderr_mode)?;
    let outcomes = pipeline.wait();

    if pipeline::is_success(&outcomes) {
        return Ok(SyncOutcome::Transferred { snapshot_name: child.name() });
    }

    cleanup_partial_file_sink(dest, child);

    let failed = outcomes
        .into_iter()
        .find(|o| o.exit_code != 0)
        .expect("is_success was false, so some stage failed");
    Ok(SyncOutcome::Failed {
        snapshot_name: child.name(),
        argv: failed.argv,
        exit_code: failed.exit_code,
        stderr: failed.stderr,
    })
}

/// The newest snapshot present, by exact name, in both lists (§4.C): the
/// greatest common snapshot, used as `btrfs send`'s `-p` parent.
fn common_parent(source_list: &[Snapshot], dest_list: &[Snapshot]) -> Option<Snapshot> {
    source_list
        .iter()
        .filter(|s| dest_list.iter().any(|d| d.name() == s.name()))
        .max_by(|a, b| a.order(b))
        .cloned()
}

fn build_source_stages(
    source: &Repository,
    child: &Snapshot,
    parent: Option<&Snapshot>,
    filters: &FilterSpec,
) -> Result<Vec<RawStage>, ConfigError> {
    let mut stages = Vec::new();
    match source.send_stage(child, parent) {
        SendStage::Process(stage) => {
            stages.push(stage);
            for argv in filters.stages() {
                stages.push(RawStage::new(argv.clone(), source.is_remote()));
            }
        }
        SendStage::FileSource(path) => {
            if !filters.contains_file_token() {
                return Err(ConfigError::MissingFileToken);
            }
            for argv in filters.resolve(&path) {
                stages.push(RawStage::new(argv, source.is_remote()));
            }
        }
    }
    Ok(stages)
}

fn build_dest_stages(
    dest: &Repository,
    child: &Snapshot,
    filters: &FilterSpec,
) -> Result<Vec<RawStage>, ConfigError> {
    let mut stages = Vec::new();
    match dest.receive_stage(&child.name()) {
        ReceiveStage::Process(stage) => {
            for argv in filters.stages() {
                stages.push(RawStage::new(argv.clone(), dest.is_remote()));
            }
            stages.push(stage);
        }
        ReceiveStage::FileSink(path) => {
            if !filters.contains_file_token() {
                return Err(ConfigError::MissingFileToken);
            }
            for argv in filters.resolve(&path) {
                stages.push(RawStage::new(argv, dest.is_remote()));
            }
        }
    }
    Ok(stages)
}

/// Removes a partially-written file-repository blob after a failed transfer
/// (§8 scenario: a failed sync must not leave a corrupt blob behind that
/// `list` would later mistake for a real snapshot).
fn cleanup_partial_file_sink(dest: &Repository, child: &Snapshot) {
    let ReceiveStage::FileSink(path) = dest.receive_stage(&child.name()) else {
        return;
    };
    if dest.is_remote() {
        let argv = crate::exec::remote_argv(dest.remote_cmd(), &["rm".to_string(), "-f".to_string(), path_string(&path)]);
        let _ = crate::exec::run(&argv, std::process::Stdio::null(), false, StderrMode::Discard);
    } else {
        let _ = std::fs::remove_file(&path);
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filterspec::FilterRole;
    use crate::repository::RepositoryKind;
    use chrono::{DateTime, TimeZone, Utc};
    use std::fs;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("btrfs-backup-sync-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn common_parent_picks_newest_shared_snapshot() {
        let root = Path::new("/repo");
        let a = Snapshot::new("sv", ts(2024, 1, 1), 0, None, root);
        let b = Snapshot::new("sv", ts(2024, 1, 2), 0, None, root);
        let c = Snapshot::new("sv", ts(2024, 1, 3), 0, None, root);

        let source_list = vec![a.clone(), b.clone(), c.clone()];
        let dest_list = vec![a.clone(), b.clone()];

        let parent = common_parent(&source_list, &dest_list).unwrap();
        assert_eq!(parent.name(), b.name());
    }

    #[test]
    fn common_parent_is_none_when_no_overlap() {
        let root = Path::new("/repo");
        let a = Snapshot::new("sv", ts(2024, 1, 1), 0, None, root);
        let b = Snapshot::new("sv", ts(2024, 1, 2), 0, None, root);
        assert!(common_parent(&[a], &[b]).is_none());
    }

    #[test]
    fn file_source_without_filters_is_config_error() {
        let root = scratch_dir("file-source");
        let repo = Repository::local(&root, RepositoryKind::File { extension: "blob".into() });
        let snapshot = Snapshot::new("sv", ts(2024, 1, 1), 0, Some("blob".into()), &root);

        let err = build_source_stages(&repo, &snapshot, None, &FilterSpec::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFileToken));
    }

    #[test]
    fn file_source_with_filters_missing_token_is_config_error() {
        let root = scratch_dir("file-source-bad");
        let repo = Repository::local(&root, RepositoryKind::File { extension: "blob".into() });
        let snapshot = Snapshot::new("sv", ts(2024, 1, 1), 0, Some("blob".into()), &root);

        let filters = FilterSpec::new(vec![vec!["/usr/bin/gzip".to_string()]], FilterRole::Send).unwrap();
        let err = build_source_stages(&repo, &snapshot, None, &filters).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFileToken));
    }

    #[test]
    fn file_source_with_file_token_resolves_to_filter_chain() {
        let root = scratch_dir("file-source-ok");
        let repo = Repository::local(&root, RepositoryKind::File { extension: "gpg".into() });
        let snapshot = Snapshot::new("sv", ts(2024, 1, 1), 0, Some("gpg".into()), &root);

        let filters = FilterSpec::new(
            vec![vec!["/usr/bin/gpg".to_string(), "-d".to_string(), crate::filterspec::FILE_TOKEN.to_string()]],
            FilterRole::Send,
        )
        .unwrap();
        let stages = build_source_stages(&repo, &snapshot, None, &filters).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].argv[0], "/usr/bin/gpg");
        assert_eq!(stages[0].argv[2], path_string(snapshot.path()));
    }

    #[test]
    fn file_sink_without_filters_is_config_error() {
        let root = scratch_dir("file-sink");
        let repo = Repository::local(&root, RepositoryKind::File { extension: "blob".into() });
        let snapshot = Snapshot::new("sv", ts(2024, 1, 1), 0, None, &root);

        let err = build_dest_stages(&repo, &snapshot, &FilterSpec::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFileToken));
    }

    #[test]
    fn subvolume_receive_runs_filters_before_receive_stage() {
        let root = scratch_dir("subvol-sink");
        let repo = Repository::local(&root, RepositoryKind::Subvolume);
        let snapshot = Snapshot::new("sv", ts(2024, 1, 1), 0, None, &root);

        let filters = FilterSpec::new(vec![vec!["/usr/bin/gunzip".to_string()]], FilterRole::Recv).unwrap();
        let stages = build_dest_stages(&repo, &snapshot, &filters).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].argv[0], "/usr/bin/gunzip");
        assert_eq!(stages[1].argv[0], "btrfs");
    }

    #[test]
    fn noop_detected_before_any_pipeline_is_built() {
        let source_root = scratch_dir("noop-source");
        let dest_root = scratch_dir("noop-dest");

        // Both repositories already hold the same snapshot; `source.snapshot`
        // would need a real btrfs filesystem, so this test only exercises the
        // pre-pipeline short-circuit directly against prepared listings.
        let a = Snapshot::new("sv", ts(2024, 1, 1), 0, None, &source_root);
        fs::File::create(a.path()).unwrap();
        let b = Snapshot::new("sv", ts(2024, 1, 1), 0, None, &dest_root);
        fs::File::create(b.path()).unwrap();

        let source = Repository::local(&source_root, RepositoryKind::Subvolume);
        let dest = Repository::local(&dest_root, RepositoryKind::Subvolume);

        let dest_list = dest.list("sv").unwrap();
        assert!(dest_list.iter().any(|s| s.name() == a.name()));
        let _ = source;
    }
}
