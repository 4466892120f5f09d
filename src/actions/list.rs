use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::actions::Context;
use crate::reader::list::{self, ListOptions};

/// List backed-up names as of a given time
#[derive(Debug, Clone, Parser)]
pub struct ListArgs {
    /// Backup destination directory
    pub dest: PathBuf,

    /// Wall-clock time to list as of, in RFC3339 or a humantime-style
    /// duration before now (e.g. "3 days")
    #[arg(long)]
    pub at: Option<String>,

    /// Restrict listing to this source-relative sub-path
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Print full metadata for each entry
    #[arg(long)]
    pub long: bool,

    /// Print every historical revision, not just the one as of `--at`
    #[arg(long)]
    pub history: bool,
}

pub fn run(ctx: Context<ListArgs>) -> Result<()> {
    let args = ctx.args_top;
    let at = super::parse_at(args.at.as_deref())?;

    let options = ListOptions { at, long: args.long, history: args.history };
    let entries = list::list(&args.dest, args.path.as_deref(), &options)
        .into_diagnostic()
        .wrap_err("listing backup entries")?;

    for entry in entries {
        if args.long {
            println!(
                "{}\t{}\tr{}\tmode={:o}\tuid={}\tgid={}\tsize={}\tmtime={}",
                entry.relative_path.display(),
                entry.metadata.kind.code(),
                entry.revision,
                entry.metadata.mode,
                entry.metadata.uid,
                entry.metadata.gid,
                entry.metadata.size,
                entry.metadata.mtime,
            );
        } else {
            println!("{}", entry.relative_path.display());
        }
    }

    Ok(())
}
