use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::actions::Context;
use crate::reader::restore::{self, RestoreOptions};

/// Reconstruct backed-up files as of a given time
#[derive(Debug, Clone, Parser)]
pub struct RestoreArgs {
    /// Backup destination directory
    pub dest: PathBuf,

    /// Directory to write restored files into
    pub target: PathBuf,

    /// Wall-clock time to restore as of, in RFC3339 or a humantime-style
    /// duration before now (e.g. "3 days")
    #[arg(long)]
    pub at: Option<String>,

    /// Restrict restoration to this source-relative sub-path
    #[arg(long)]
    pub path: Option<PathBuf>,
}

pub fn run(ctx: Context<RestoreArgs>) -> Result<()> {
    let args = ctx.args_top;
    let at = super::parse_at(args.at.as_deref())?;

    let options = RestoreOptions { at };
    restore::restore(&args.dest, args.path.as_deref(), &args.target, &options)
        .into_diagnostic()
        .wrap_err("restoring backup")?;

    Ok(())
}
