//! Snapshot identity: name grammar, parsing, formatting, and ordering.
//!
//! Name grammar: `<tag>-<YYYY-MM-DD_HH:MM:SS>_<gen>[.<ext>]`. Anything that
//! doesn't match is not a snapshot name and is ignored by callers.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<tag>.+)-(?P<ts>\d{4}-\d{2}-\d{2}_\d{2}:\d{2}:\d{2})_(?P<gen>\d+)(?:\.(?P<ext>[A-Za-z0-9]+))?$")
            .expect("snapshot name pattern is a valid regex")
    })
}

/// An immutable, point-in-time snapshot of a subvolume, located inside a
/// repository directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    tag: String,
    timestamp: DateTime<Utc>,
    generation: u64,
    extension: Option<String>,
    path: PathBuf,
}

impl Snapshot {
    /// Builds a [`Snapshot`] from its parsed identity and the directory it
    /// lives in.
    pub fn new(
        tag: impl Into<String>,
        timestamp: DateTime<Utc>,
        generation: u64,
        extension: Option<String>,
        repo_root: &Path,
    ) -> Self {
        let tag = tag.into();
        let name = make_name(&tag, timestamp, generation, extension.as_deref());
        Snapshot {
            tag,
            timestamp,
            generation,
            extension,
            path: repo_root.join(name),
        }
    }

    /// Parses a single directory-entry filename. Returns `None` when the
    /// entry doesn't match the snapshot name grammar; such entries are
    /// silently ignored by repository listings rather than reported as
    /// errors (§7: name-parse errors are recoverable).
    pub fn parse(file_name: &str, repo_root: &Path) -> Option<Self> {
        let parsed = parse_name(file_name)?;
        Some(Snapshot::new(
            parsed.tag,
            parsed.timestamp,
            parsed.generation,
            parsed.extension,
            repo_root,
        ))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The snapshot's name, per the §3 grammar.
    pub fn name(&self) -> String {
        make_name(&self.tag, self.timestamp, self.generation, self.extension.as_deref())
    }

    /// Total order by `(timestamp, generation)`, ascending. Callers that
    /// compare snapshots of different subvolumes are responsible for
    /// checking `tag` equality first (§4.C).
    pub fn order(&self, other: &Self) -> Ordering {
        (self.timestamp, self.generation).cmp(&(other.timestamp, other.generation))
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// The parsed components of a snapshot name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub generation: u64,
    pub extension: Option<String>,
}

/// Formats a snapshot name per the §3 grammar.
pub fn make_name(tag: &str, timestamp: DateTime<Utc>, generation: u64, extension: Option<&str>) -> String {
    let ts = timestamp.format(TIMESTAMP_FORMAT);
    match extension {
        Some(ext) => format!("{tag}-{ts}_{generation}.{ext}"),
        None => format!("{tag}-{ts}_{generation}"),
    }
}

/// Parses a snapshot name per the §3 grammar. Returns `None` if `name`
/// doesn't match.
pub fn parse_name(name: &str) -> Option<ParsedName> {
    let captures = name_pattern().captures(name)?;
    let tag = captures.name("tag")?.as_str().to_string();
    let ts_raw = captures.name("ts")?.as_str();
    let generation: u64 = captures.name("gen")?.as_str().parse().ok()?;
    let extension = captures.name("ext").map(|m| m.as_str().to_string());

    let naive = NaiveDateTime::parse_from_str(ts_raw, TIMESTAMP_FORMAT).ok()?;
    let timestamp = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);

    Some(ParsedName {
        tag,
        timestamp,
        generation,
        extension,
    })
}

/// Picks the next generation number for `(tag, timestamp)`, one greater than
/// the highest generation already present among `existing` for that exact
/// pair, or `0` if none exists.
pub fn next_generation(existing: &[Snapshot], tag: &str, timestamp: DateTime<Utc>) -> u64 {
    existing
        .iter()
        .filter(|s| s.tag() == tag && s.timestamp() == timestamp)
        .map(Snapshot::generation)
        .max()
        .map_or(0, |gen| gen + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn make_then_parse_round_trips() {
        let timestamp = ts(2024, 1, 15, 12, 0, 0);
        let name = make_name("sv", timestamp, 0, None);
        assert_eq!(name, "sv-2024-01-15_12:00:00_0");

        let parsed = parse_name(&name).unwrap();
        assert_eq!(parsed.tag, "sv");
        assert_eq!(parsed.timestamp, timestamp);
        assert_eq!(parsed.generation, 0);
        assert_eq!(parsed.extension, None);
        assert_eq!(make_name(&parsed.tag, parsed.timestamp, parsed.generation, parsed.extension.as_deref()), name);
    }

    #[test]
    fn file_repository_extension_round_trips() {
        let timestamp = ts(2024, 1, 15, 12, 0, 0);
        let name = make_name("sv", timestamp, 3, Some("gpg"));
        assert_eq!(name, "sv-2024-01-15_12:00:00_3.gpg");

        let parsed = parse_name(&name).unwrap();
        assert_eq!(parsed.extension.as_deref(), Some("gpg"));
    }

    #[test]
    fn tag_with_hyphens_parses_correctly() {
        let timestamp = ts(2024, 1, 15, 12, 0, 0);
        let name = make_name("my-sub-vol", timestamp, 0, None);
        let parsed = parse_name(&name).unwrap();
        assert_eq!(parsed.tag, "my-sub-vol");
    }

    #[test]
    fn unparseable_entries_return_none() {
        assert!(parse_name("not-a-snapshot").is_none());
        assert!(parse_name("sv-2024-01-15_12-00-00_0").is_none());
        assert!(parse_name(".snapshot-meta").is_none());
    }

    #[test]
    fn ordering_is_by_timestamp_then_generation() {
        let root = Path::new("/repo");
        let earlier = Snapshot::new("sv", ts(2024, 1, 15, 12, 0, 0), 0, None, root);
        let later = Snapshot::new("sv", ts(2024, 1, 15, 12, 5, 0), 0, None, root);
        let same_time_gen1 = Snapshot::new("sv", ts(2024, 1, 15, 12, 0, 0), 1, None, root);

        assert_eq!(earlier.order(&later), Ordering::Less);
        assert_eq!(earlier.order(&same_time_gen1), Ordering::Less);
        assert_eq!(later.order(&same_time_gen1), Ordering::Greater);
    }

    #[test]
    fn next_generation_disambiguates_same_timestamp() {
        let root = Path::new("/repo");
        let timestamp = ts(2024, 1, 15, 12, 0, 0);
        let existing = vec![Snapshot::new("sv", timestamp, 0, None, root)];
        assert_eq!(next_generation(&existing, "sv", timestamp), 1);
        assert_eq!(next_generation(&existing, "sv", timestamp + chrono::Duration::seconds(1)), 0);
        assert_eq!(next_generation(&[], "sv", timestamp), 0);
    }
}
