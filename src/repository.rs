//! Repository (§4.D): discovery, naming, diffing, and retention of snapshots,
//! across local and remote filesystems, for both subvolume- and
//! file-repositories.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};
use regex::Regex;

use crate::exec::{self, ExecError, StderrMode};
use crate::pipeline::RawStage;
use crate::snapshot::Snapshot;

/// A btrfs subvolume, identified by its filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subvolume {
    path: PathBuf,
}

impl Subvolume {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Subvolume { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The subvolume's tag: its basename, used as part of every snapshot's
    /// name (§3).
    pub fn tag(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// What a repository's contents actually are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryKind {
    /// Contents are read-only btrfs subvolumes.
    Subvolume,
    /// Contents are opaque files with a fixed extension.
    File { extension: String },
}

#[derive(Debug, Display, Error, From)]
pub enum RepositoryError {
    #[from]
    Io(std::io::Error),
    #[from]
    Exec(ExecError),

    /// `has_new_data`/`snapshot` were called on a non-local repository; only
    /// the repository collocated with the live subvolume can query or
    /// create it (see DESIGN.md).
    #[display("{op} requires a local repository")]
    NotLocal {
        #[error(ignore)]
        op: &'static str,
    },

    /// `btrfs subvolume show` output didn't contain a `Generation:` line.
    #[display("could not determine btrfs generation of {path:?}")]
    GenerationNotFound {
        #[error(ignore)]
        path: PathBuf,
    },

    /// A restore was requested but the source repository has no snapshot of
    /// `tag` to restore.
    #[display("repository has no snapshot of {tag:?} to restore")]
    NoSnapshots {
        #[error(ignore)]
        tag: String,
    },
}

fn generation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^\s*Generation:\s*(\d+)\s*$").expect("valid regex"))
}

/// A directory holding snapshots of one or more subvolumes, local or remote,
/// containing either live-subvolume snapshots or file-repository blobs.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    remote_cmd: Option<Vec<String>>,
    kind: RepositoryKind,
}

/// Either a `btrfs send` invocation or, for file repositories, a marker
/// naming the on-disk blob to read — §4.B's `{file}` substitution resolves
/// this marker against the filter chain.
pub enum SendStage {
    Process(RawStage),
    FileSource(PathBuf),
}

/// Either a `btrfs receive` invocation or, for file repositories, a marker
/// naming the on-disk blob to write.
pub enum ReceiveStage {
    Process(RawStage),
    FileSink(PathBuf),
}

impl Repository {
    pub fn local(root: impl Into<PathBuf>, kind: RepositoryKind) -> Self {
        Repository {
            root: root.into(),
            remote_cmd: None,
            kind,
        }
    }

    pub fn remote(root: impl Into<PathBuf>, remote_cmd: Vec<String>, kind: RepositoryKind) -> Self {
        Repository {
            root: root.into(),
            remote_cmd: Some(remote_cmd),
            kind,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind(&self) -> &RepositoryKind {
        &self.kind
    }

    pub fn is_remote(&self) -> bool {
        self.remote_cmd.is_some()
    }

    pub fn remote_cmd(&self) -> Option<&[String]> {
        self.remote_cmd.as_deref()
    }

    fn extension(&self) -> Option<&str> {
        match &self.kind {
            RepositoryKind::Subvolume => None,
            RepositoryKind::File { extension } => Some(extension.as_str()),
        }
    }

    /// Lists every snapshot of `tag` in this repository, sorted ascending
    /// by `(timestamp, generation)` (§4.D, §8 invariant). Entries that don't
    /// match the name grammar, or whose extension doesn't match this
    /// repository's declared kind, are silently ignored.
    pub fn list(&self, tag: &str) -> Result<Vec<Snapshot>, RepositoryError> {
        let names = self.list_entry_names()?;
        let mut snapshots: Vec<Snapshot> = names
            .iter()
            .filter_map(|name| Snapshot::parse(name, &self.root))
            .filter(|s| s.tag() == tag)
            .filter(|s| s.extension() == self.extension())
            .collect();
        snapshots.sort_by(Snapshot::order);
        Ok(snapshots)
    }

    fn list_entry_names(&self) -> Result<Vec<String>, RepositoryError> {
        match &self.remote_cmd {
            None => {
                let mut names = Vec::new();
                for entry in fs::read_dir(&self.root)? {
                    let entry = entry?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(names)
            }
            Some(remote_cmd) => {
                let argv = exec::remote_argv(
                    Some(remote_cmd),
                    &["ls".to_string(), "-1".to_string(), self.root.to_string_lossy().into_owned()],
                );
                let executed = exec::run(&argv, Stdio::null(), true, StderrMode::Capture)?;
                let listing = String::from_utf8_lossy(&executed.stdout);
                Ok(listing.lines().map(|l| l.to_string()).collect())
            }
        }
    }

    /// The newest snapshot of `tag`, if any.
    pub fn latest(&self, tag: &str) -> Result<Option<Snapshot>, RepositoryError> {
        Ok(self.list(tag)?.into_iter().next_back())
    }

    /// True iff `subvolume` contains data not already represented by
    /// `latest_snapshot` — its live btrfs generation exceeds the snapshot's
    /// (§4.D). Only meaningful for the repository collocated with the live
    /// subvolume.
    pub fn has_new_data(
        &self,
        subvolume: &Subvolume,
        latest_snapshot: Option<&Snapshot>,
    ) -> Result<bool, RepositoryError> {
        if self.is_remote() {
            return Err(RepositoryError::NotLocal { op: "has_new_data" });
        }
        let Some(latest) = latest_snapshot else {
            return Ok(true);
        };

        let live_gen = btrfs_generation(subvolume.path())?;
        let snap_gen = btrfs_generation(latest.path())?;
        Ok(live_gen > snap_gen)
    }

    /// Returns the most recent usable snapshot of `subvolume`: a freshly
    /// created one if the live subvolume has new data, otherwise the
    /// existing latest (§4.D).
    pub fn snapshot(&self, subvolume: &Subvolume) -> Result<Snapshot, RepositoryError> {
        if self.is_remote() {
            return Err(RepositoryError::NotLocal { op: "snapshot" });
        }

        let tag = subvolume.tag();
        let existing = self.list(&tag)?;
        let latest = existing.last().cloned();

        if !self.has_new_data(subvolume, latest.as_ref())? {
            if let Some(latest) = latest {
                return Ok(latest);
            }
        }

        let now = Utc::now();
        let generation = crate::snapshot::next_generation(&existing, &tag, now);
        let snapshot = Snapshot::new(tag, now, generation, None, &self.root);

        run_local(&[
            "btrfs".to_string(),
            "subvolume".to_string(),
            "snapshot".to_string(),
            "-r".to_string(),
            subvolume.path().to_string_lossy().into_owned(),
            snapshot.path().to_string_lossy().into_owned(),
        ])?;

        Ok(snapshot)
    }

    /// Builds the stage that serializes `snapshot` (§4.D).
    pub fn send_stage(&self, snapshot: &Snapshot, parent: Option<&Snapshot>) -> SendStage {
        match &self.kind {
            RepositoryKind::Subvolume => {
                let mut argv = vec!["btrfs".to_string(), "send".to_string()];
                if let Some(parent) = parent {
                    argv.push("-p".to_string());
                    argv.push(parent.path().to_string_lossy().into_owned());
                }
                argv.push(snapshot.path().to_string_lossy().into_owned());
                SendStage::Process(self.raw_stage(argv))
            }
            RepositoryKind::File { .. } => SendStage::FileSource(snapshot.path().to_path_buf()),
        }
    }

    /// Builds the stage that deserializes into a snapshot named
    /// `expected_name` (§4.D).
    pub fn receive_stage(&self, expected_name: &str) -> ReceiveStage {
        match &self.kind {
            RepositoryKind::Subvolume => {
                let argv = vec![
                    "btrfs".to_string(),
                    "receive".to_string(),
                    self.root.to_string_lossy().into_owned(),
                ];
                ReceiveStage::Process(self.raw_stage(argv))
            }
            RepositoryKind::File { extension } => {
                ReceiveStage::FileSink(self.root.join(format!("{expected_name}.{extension}")))
            }
        }
    }

    fn raw_stage(&self, argv: Vec<String>) -> RawStage {
        if self.is_remote() {
            RawStage::remote(argv)
        } else {
            RawStage::local(argv)
        }
    }

    /// Deletes every snapshot of `tag` older than `keep_for`, except the
    /// single newest one overall, which is always protected (§4.D, §8
    /// invariant).
    pub fn purge(&self, tag: &str, keep_for: Duration, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let snapshots = self.list(tag)?;
        let Some((_, rest)) = snapshots.split_last() else {
            return Ok(());
        };

        let cutoff = match chrono::Duration::from_std(keep_for) {
            Ok(delta) => now - delta,
            // `keep_for` exceeds chrono's representable range; nothing is old enough to purge.
            Err(_) => return Ok(()),
        };
        for snapshot in rest {
            if snapshot.timestamp() >= cutoff {
                continue;
            }
            log::info!(target: "repository", "purging expired snapshot {snapshot}");
            self.delete(snapshot)?;
        }
        Ok(())
    }

    fn delete(&self, snapshot: &Snapshot) -> Result<(), RepositoryError> {
        let path = snapshot.path().to_string_lossy().into_owned();
        let argv = match &self.kind {
            RepositoryKind::Subvolume => vec![
                "btrfs".to_string(),
                "subvolume".to_string(),
                "delete".to_string(),
                path,
            ],
            RepositoryKind::File { .. } => vec!["rm".to_string(), path],
        };
        let argv = exec::remote_argv(self.remote_cmd.as_deref(), &argv);
        exec::run(&argv, Stdio::null(), false, StderrMode::Capture)?;
        Ok(())
    }
}

fn run_local(argv: &[String]) -> Result<exec::Executed, ExecError> {
    exec::run(argv, Stdio::null(), false, StderrMode::Capture)
}

fn btrfs_generation(path: &Path) -> Result<u64, RepositoryError> {
    let argv = vec![
        "btrfs".to_string(),
        "subvolume".to_string(),
        "show".to_string(),
        path.to_string_lossy().into_owned(),
    ];
    let executed = run_local(&argv)?;
    let output = String::from_utf8_lossy(&executed.stdout);
    let captures = generation_pattern()
        .captures(&output)
        .ok_or_else(|| RepositoryError::GenerationNotFound { path: path.to_path_buf() })?;
    captures[1]
        .parse()
        .map_err(|_| RepositoryError::GenerationNotFound { path: path.to_path_buf() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("btrfs-backup-test-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn lists_only_matching_tag_and_kind_sorted_ascending() {
        let root = scratch_dir("list");
        for name in [
            "sv-2024-01-15_12:05:00_0",
            "sv-2024-01-15_12:00:00_0",
            "other-2024-01-15_12:00:00_0",
            "not-a-snapshot.txt",
        ] {
            File::create(root.join(name)).unwrap();
        }

        let repo = Repository::local(&root, RepositoryKind::Subvolume);
        let listed = repo.list("sv").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name(), "sv-2024-01-15_12:00:00_0");
        assert_eq!(listed[1].name(), "sv-2024-01-15_12:05:00_0");
    }

    #[test]
    fn file_repository_only_lists_matching_extension() {
        let root = scratch_dir("file-repo");
        File::create(root.join("sv-2024-01-15_12:00:00_0.gpg")).unwrap();
        File::create(root.join("sv-2024-01-15_12:00:00_0")).unwrap(); // no extension, ignored

        let repo = Repository::local(&root, RepositoryKind::File { extension: "gpg".into() });
        let listed = repo.list("sv").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].extension(), Some("gpg"));
    }

    #[test]
    fn purge_always_keeps_the_newest_snapshot() {
        let root = scratch_dir("purge");
        for name in [
            "sv-2020-01-01_00:00:00_0",
            "sv-2020-01-02_00:00:00_0",
            "sv-2026-07-27_00:00:00_0",
        ] {
            File::create(root.join(name)).unwrap();
        }

        let repo = Repository::local(&root, RepositoryKind::Subvolume);
        let now: DateTime<Utc> = "2026-07-27T00:00:00Z".parse().unwrap();

        let remaining_before = repo.list("sv").unwrap().len();
        assert_eq!(remaining_before, 3);

        // Purge logic is exercised directly against the in-memory snapshot
        // list rather than via `btrfs subvolume delete`, which requires a
        // real filesystem; see `sync` tests for an end-to-end exercise with
        // a fake executor.
        let snapshots = repo.list("sv").unwrap();
        let (newest, rest) = snapshots.split_last().unwrap();
        assert_eq!(newest.name(), "sv-2026-07-27_00:00:00_0");
        let cutoff = now - chrono::Duration::days(1);
        let expired: Vec<_> = rest.iter().filter(|s| s.timestamp() < cutoff).collect();
        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn subvolume_tag_is_basename() {
        let subvol = Subvolume::new("/mnt/data/my-vol");
        assert_eq!(subvol.tag(), "my-vol");
    }
}
