//! Filter specs (§3): ordered lists of external commands spliced into the
//! transfer pipeline after serialization (send filters) or before
//! deserialization (receive filters).

use std::path::Path;

use crate::error::ConfigError;

pub const FILE_TOKEN: &str = "{file}";

/// Which side of the pipeline a [`FilterSpec`] is inserted on. This decides
/// where the `{file}` token is allowed to appear (§3, §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRole {
    Send,
    Recv,
}

/// A validated, ordered list of filter commands.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    stages: Vec<Vec<String>>,
    role: Option<FilterRole>,
}

impl FilterSpec {
    /// Validates `stages` against the §3/§6 rules: every command is an
    /// absolute path, and at most one stage contains the literal `{file}`
    /// token, only in the position `role` allows (first stage for `Send`,
    /// last stage for `Recv`).
    pub fn new(stages: Vec<Vec<String>>, role: FilterRole) -> Result<Self, ConfigError> {
        for argv in &stages {
            let Some(program) = argv.first() else {
                return Err(ConfigError::EmptyFilterCommand);
            };
            if !Path::new(program).is_absolute() {
                return Err(ConfigError::FilterPathNotAbsolute { program: program.clone() });
            }
        }

        let token_positions: Vec<usize> = stages
            .iter()
            .enumerate()
            .filter(|(_, argv)| argv.iter().any(|a| a == FILE_TOKEN))
            .map(|(i, _)| i)
            .collect();

        if token_positions.len() > 1 {
            return Err(ConfigError::MultipleFileTokens);
        }
        if let Some(&pos) = token_positions.first() {
            let allowed = match role {
                FilterRole::Send => pos == 0,
                FilterRole::Recv => pos == stages.len() - 1,
            };
            if !allowed {
                return Err(ConfigError::FileTokenMisplaced { role });
            }
        }

        Ok(FilterSpec {
            stages,
            role: Some(role),
        })
    }

    pub fn stages(&self) -> &[Vec<String>] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains_file_token(&self) -> bool {
        self.stages.iter().any(|argv| argv.iter().any(|a| a == FILE_TOKEN))
    }

    /// Returns this filter's stages with the `{file}` token (if present)
    /// substituted for `path`'s absolute form.
    pub fn resolve(&self, path: &std::path::Path) -> Vec<Vec<String>> {
        let replacement = path.to_string_lossy().into_owned();
        self.stages
            .iter()
            .map(|argv| {
                argv.iter()
                    .map(|arg| if arg == FILE_TOKEN { replacement.clone() } else { arg.clone() })
                    .collect()
            })
            .collect()
    }

    /// The role this spec was validated for, if it was constructed via
    /// [`FilterSpec::new`]. `None` for a `Default`-constructed empty spec
    /// whose role hasn't been assigned yet.
    pub fn role(&self) -> Option<FilterRole> {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(bin: &str) -> String {
        format!("/usr/bin/{bin}")
    }

    #[test]
    fn accepts_absolute_paths_without_file_token() {
        let spec = FilterSpec::new(vec![vec![abs("gzip")]], FilterRole::Send).unwrap();
        assert!(!spec.contains_file_token());
    }

    #[test]
    fn rejects_relative_filter_path() {
        let err = FilterSpec::new(vec![vec!["gzip".to_string()]], FilterRole::Send).unwrap_err();
        assert!(matches!(err, ConfigError::FilterPathNotAbsolute { .. }));
    }

    #[test]
    fn file_token_allowed_as_first_send_filter() {
        let spec = FilterSpec::new(
            vec![vec![abs("gpg"), "-d".into(), FILE_TOKEN.into()], vec![abs("gunzip")]],
            FilterRole::Send,
        )
        .unwrap();
        assert!(spec.contains_file_token());
    }

    #[test]
    fn file_token_rejected_in_non_terminal_recv_filter() {
        let err = FilterSpec::new(
            vec![vec![abs("gpg"), "-e".into(), FILE_TOKEN.into()], vec![abs("gzip")]],
            FilterRole::Recv,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::FileTokenMisplaced { .. }));
    }

    #[test]
    fn file_token_allowed_as_last_recv_filter() {
        let spec = FilterSpec::new(
            vec![vec![abs("gzip")], vec![abs("tee"), FILE_TOKEN.into()]],
            FilterRole::Recv,
        )
        .unwrap();
        assert!(spec.contains_file_token());
    }

    #[test]
    fn rejects_more_than_one_file_token() {
        let err = FilterSpec::new(
            vec![vec![abs("a"), FILE_TOKEN.into()], vec![abs("b"), FILE_TOKEN.into()]],
            FilterRole::Recv,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MultipleFileTokens));
    }

    #[test]
    fn resolve_substitutes_token_with_path() {
        let spec = FilterSpec::new(vec![vec![abs("cat"), FILE_TOKEN.into()]], FilterRole::Send).unwrap();
        let resolved = spec.resolve(std::path::Path::new("/repo/sv-1.gpg"));
        assert_eq!(resolved, vec![vec![abs("cat"), "/repo/sv-1.gpg".to_string()]]);
    }
}
