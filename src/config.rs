//! Immutable daemon configuration (REDESIGN FLAG, §9: "process-wide
//! configuration ... re-express as an immutable `Config`").

use std::path::PathBuf;
use std::time::Duration;

use crate::exclude::ExclusionSet;

#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub debounce: Duration,
    pub full_sync_interval: Duration,
    pub exclusions: ExclusionSet,
    pub threads: usize,
    pub max_watches: usize,
    pub max_bsdiff: u64,
}

impl Config {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.threads == 0 {
            return Err(crate::error::Error::ConfigError("threads must be at least 1".into()));
        }
        if !self.source.is_absolute() {
            return Err(crate::error::Error::ConfigError("source must be an absolute path".into()));
        }
        if !self.dest.is_absolute() {
            return Err(crate::error::Error::ConfigError("dest must be an absolute path".into()));
        }
        Ok(())
    }
}
