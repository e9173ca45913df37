//! Crate-wide error types (§7): configuration errors are fatal and abort the
//! whole invocation; everything else is handled per-subvolume by the sync
//! engine and never propagates as a top-level [`Error`].

use derive_more::{Display, Error, From};

use crate::duration::DurationParseError;
use crate::filterspec::FilterRole;

/// A configuration error (§7): invalid argv combination, missing `{file}`
/// token when required, non-absolute filter path, unparseable duration.
/// Always fatal — the whole invocation aborts before any command runs.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("filter command must not be empty")]
    EmptyFilterCommand,

    #[display("filter command {program:?} must be an absolute path")]
    FilterPathNotAbsolute {
        #[error(ignore)]
        program: String,
    },

    #[display("--remote-cmd {program:?} must be an absolute path")]
    RemoteCmdNotAbsolute {
        #[error(ignore)]
        program: String,
    },

    #[display("the {{file}} token may appear at most once across a filter spec")]
    MultipleFileTokens,

    #[display("the {{file}} token is only allowed in the first send filter or the last receive filter (got it in a {role:?} filter at the wrong position)")]
    FileTokenMisplaced {
        #[error(ignore)]
        role: FilterRole,
    },

    #[display("--snapshot-ext requires a filter containing {{file}} in the correct position, but none was given")]
    MissingFileToken,

    #[display("at least one --subvolume must be given")]
    NoSubvolumes,

    #[from]
    Duration(DurationParseError),
}

/// Top-level error: only configuration errors reach here. Per-subvolume
/// transfer failures are reported in a [`crate::sync::SyncOutcome`] instead,
/// so sibling subvolumes keep running (§7 propagation policy).
#[derive(Debug, Display, Error, From)]
pub enum Error {
    #[display("{_0}")]
    Config(ConfigError),
}
