use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing::info;

use crate::actions::Context;
use crate::config::Config;
use crate::exclude::ExclusionSet;
use crate::scheduler;
use crate::traversal;
use crate::watch::{ChangeEventSource, DirectoryWatcher, NotifyChangeSource};

/// Run the backup daemon
///
/// Watches `--source` for changes and maintains an incremental shadow-tree
/// history of it under `--dest`. Runs until interrupted.
#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    /// Directory to back up
    #[arg(long)]
    pub source: PathBuf,

    /// Directory to store the backup history in
    #[arg(long)]
    pub dest: PathBuf,

    /// Seconds to wait after a notification burst before processing it
    #[arg(long, default_value = "2")]
    pub debounce: u64,

    /// Seconds between periodic full-tree reconciliation scans
    #[arg(long, default_value = "3600")]
    pub full_sync_interval: u64,

    /// Path to a newline-delimited file of anchored regex exclusions
    #[arg(long)]
    pub exclude: Option<PathBuf>,

    /// Exclude dotfiles/dotdirectories at the root of the source tree
    #[arg(long)]
    pub no_root_dotfiles: bool,

    /// Number of concurrent incremental workers
    #[arg(long, default_value = "4")]
    pub threads: usize,

    /// Maximum number of directory watches to hold at once
    #[arg(long, default_value = "8192")]
    pub max_watches: usize,

    /// Byte-size threshold below which the compact (higher-memory) patch
    /// codec is used in place of the large-file codec
    #[arg(long, default_value = "16777216")]
    pub max_bsdiff: u64,
}

pub fn run(ctx: Context<RunArgs>) -> Result<()> {
    let args = ctx.args_top;

    let exclusions = match &args.exclude {
        Some(path) => ExclusionSet::from_file(path, args.no_root_dotfiles)
            .into_diagnostic()
            .wrap_err("loading exclusion file")?,
        None if args.no_root_dotfiles => ExclusionSet::from_lines(std::iter::empty(), true)
            .into_diagnostic()
            .wrap_err("building exclusion set")?,
        None => ExclusionSet::empty(),
    };

    let config = Arc::new(Config {
        source: args.source.clone(),
        dest: args.dest.clone(),
        debounce: Duration::from_secs(args.debounce),
        full_sync_interval: Duration::from_secs(args.full_sync_interval),
        exclusions,
        threads: args.threads,
        max_watches: args.max_watches,
        max_bsdiff: args.max_bsdiff,
    });

    config.validate().into_diagnostic().wrap_err("validating configuration")?;

    let watches = DirectoryWatcher::new(config.max_watches)
        .into_diagnostic()
        .wrap_err("starting directory watcher")?;

    info!(source = %config.source.display(), dest = %config.dest.display(), "starting full sync");
    traversal::full_sync_observing(&config, &watches)
        .into_diagnostic()
        .wrap_err("initial full sync")?;

    let sched = scheduler::spawn(
        Arc::clone(&config),
        config.debounce,
        config.full_sync_interval,
        Some(Arc::clone(&watches)),
    );

    let shutdown_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut source = NotifyChangeSource::new(&config.source, Arc::clone(&watches), Arc::clone(&shutdown_requested))
        .into_diagnostic()
        .wrap_err("starting change-event source")?;

    {
        let shutdown_requested = Arc::clone(&shutdown_requested);
        ctrlc::set_handler(move || {
            shutdown_requested.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .into_diagnostic()
        .wrap_err("installing signal handler")?;
    }

    info!("watching for changes");
    loop {
        if shutdown_requested.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        match source.next_event() {
            Ok(Some(path)) => sched.enqueue_path(path),
            Ok(None) => break, // notification source closed.
            Err(e) => {
                tracing::warn!(error = %e, "change-event source error");
            }
        }
    }

    info!("shutting down");
    sched.shutdown();
    Ok(())
}
