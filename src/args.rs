use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueHint};
use tracing::{debug, warn};

/// Continuous, incremental filesystem backup daemon and companion readers.
#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    after_help = "Want more detail? Try the long '--help' flag!",
    after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help."
)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
    /// Set diagnostic log level
    ///
    /// This enables diagnostic logging, which is useful for investigating issues. Use
    /// multiple times to increase verbosity. Goes up to '-vvvvv'.
    ///
    /// Setting $RUST_LOG also works, and takes precedence, but is not recommended
    /// unless you know what you're doing.
    #[arg(long, short, action = ArgAction::Count, num_args = 0)]
    pub verbose: Option<u8>,

    /// Write diagnostic logs to a file
    ///
    /// If the path provided is a directory, a file will be created in that
    /// directory. The file name will be the current date and time.
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = ".",
        value_hint = ValueHint::AnyPath,
        value_name = "PATH"
    )]
    pub log_file: Option<PathBuf>,

    /// What to do
    #[command(subcommand)]
    pub action: crate::actions::Action,
}

pub fn get_args() -> Args {
    if std::env::var("RUST_LOG").is_ok() {
        warn!("⚠ RUST_LOG environment variable set, logging options have no effect");
    }

    debug!("parsing arguments");
    let args = Args::parse();
    debug!(?args, "got arguments");
    args
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
