use clap::Subcommand;
use miette::Result;
use tracing::{debug, trace};

pub use context::Context;
pub mod context;

/// Parses a `--at`/`--age`-style time argument shared by the `list`,
/// `restore` and `purge` subcommands: an RFC3339 timestamp, or a
/// `humantime` duration interpreted as "this long before now".
pub(crate) fn parse_at(input: Option<&str>) -> Result<i64, miette::Report> {
    use miette::miette;

    let now = || -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    };

    let Some(input) = input else { return Ok(now()) };

    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(input) {
        return Ok(ts.timestamp());
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        return Ok(now() - duration.as_secs() as i64);
    }

    Err(miette!("could not parse '{input}' as an RFC3339 timestamp or a duration"))
}

/// Declares the top-level `Action` enum and its synchronous dispatch, in the
/// shape of the teacher's own `subcommands!` macro
/// (`examples/beyondessential-bestool/src/actions.rs`), adapted to a
/// non-async `run` since the engine is thread/blocking-based (§5, §9
/// REDESIGN FLAGS) and has no use for an async runtime at the CLI shell
/// either.
#[macro_export]
macro_rules! subcommands {
    (
        [$argtype:ty => $ctxcode:block]
        $(
            $modname:ident => $enumname:ident($argname:ident)
        ),+ $(,)?
    ) => {
        $(
            pub mod $modname;
        )*

        #[derive(Debug, Clone, Subcommand)]
        pub enum Action {
            $(
                $enumname($modname::$argname),
            )*
        }

        pub fn run(ctx: $argtype) -> Result<()> {
            let ctxfn = $ctxcode;
            match ctxfn(ctx)? {
                $(
                    (Action::$enumname(args), ctx) => $modname::run(ctx.with_top(args)),
                )*
            }
        }
    };
}
pub(crate) use subcommands;

use crate::args::Args;

subcommands! {
    [Args => {|args: Args| -> Result<(Action, Context<()>)> {
        let ctx = Context::new().with_top(args.action);
        debug!(version = %env!("CARGO_PKG_VERSION"), "starting up");
        trace!(?ctx, "context");
        Ok(ctx.take_top())
    }}]

    run => Run(RunArgs),
    list => List(ListArgs),
    restore => Restore(RestoreArgs),
    purge => Purge(PurgeArgs),
    completions => Completions(CompletionsArgs),
}
