use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::actions::Context;
use crate::reader::purge;

/// Delete backup history older than a given age or time
#[derive(Debug, Clone, Parser)]
#[command(group(clap::ArgGroup::new("threshold").required(true).args(["age", "at"])))]
pub struct PurgeArgs {
    /// Backup destination directory
    pub dest: PathBuf,

    /// Delete history older than this, as a humantime-style duration (e.g. "90 days")
    #[arg(long)]
    pub age: Option<String>,

    /// Delete history older than this RFC3339 timestamp
    #[arg(long)]
    pub at: Option<String>,
}

pub fn run(ctx: Context<PurgeArgs>) -> Result<()> {
    let args = ctx.args_top;

    let cutoff = if let Some(age) = &args.age {
        super::parse_at(Some(age.as_str()))?
    } else {
        super::parse_at(args.at.as_deref())?
    };

    purge::purge(&args.dest, cutoff).into_diagnostic().wrap_err("purging backup history")?;

    Ok(())
}
