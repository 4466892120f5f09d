//! Anchored-regex exclusion predicate (§4.7). Each non-empty line of the
//! exclusion file is framed with `^(?:...)$` and compiled; `excluded`
//! additionally honours the "no root dotfiles" flag.

use std::path::Path;

use regex::RegexSet;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ExclusionSet {
    patterns: RegexSet,
    no_root_dotfiles: bool,
}

impl ExclusionSet {
    pub fn empty() -> Self {
        ExclusionSet {
            patterns: RegexSet::new::<_, &str>([]).expect("empty regex set always compiles"),
            no_root_dotfiles: false,
        }
    }

    pub fn from_file(path: &Path, no_root_dotfiles: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_lines(text.lines(), no_root_dotfiles)
    }

    pub fn from_lines<'a>(lines: impl Iterator<Item = &'a str>, no_root_dotfiles: bool) -> Result<Self> {
        let anchored: Vec<String> = lines
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| format!("^(?:{l})$"))
            .collect();

        let patterns = RegexSet::new(&anchored)
            .map_err(|e| Error::ConfigError(format!("invalid exclusion pattern: {e}")))?;

        Ok(ExclusionSet { patterns, no_root_dotfiles })
    }

    /// `excluded(relpath)` from §4.7. `relpath` uses `/`-separated segments,
    /// relative to the source root, without a leading slash.
    pub fn excluded(&self, relpath: &str) -> bool {
        if self.patterns.is_match(relpath) {
            return true;
        }
        if self.no_root_dotfiles {
            if let Some(first) = relpath.split('/').next() {
                if first.starts_with('.') {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_anchored_pattern() {
        let set = ExclusionSet::from_lines(["\\.cache(/.*)?"].into_iter(), false).unwrap();
        assert!(set.excluded(".cache"));
        assert!(set.excluded(".cache/foo"));
        assert!(!set.excluded("cache"));
        assert!(!set.excluded("src/.cache"));
    }

    #[test]
    fn no_root_dotfiles_only_checks_first_segment() {
        let set = ExclusionSet::from_lines(std::iter::empty(), true).unwrap();
        assert!(set.excluded(".git"));
        assert!(set.excluded(".git/objects"));
        assert!(!set.excluded("src/.gitignore"));
    }

    #[test]
    fn empty_set_excludes_nothing() {
        let set = ExclusionSet::empty();
        assert!(!set.excluded("anything"));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = ExclusionSet::from_lines(["(unterminated"].into_iter(), false);
        assert!(matches!(err, Err(Error::ConfigError(_))));
    }
}
