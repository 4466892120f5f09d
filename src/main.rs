#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> miette::Result<()> {
    let args = driftvault::get_args();
    setup_logging(&args)?;
    driftvault::run(args)
}

fn setup_logging(args: &driftvault::args::Args) -> miette::Result<()> {
    use tracing_subscriber::EnvFilter;

    let level = match args.verbose.unwrap_or(0) {
        0 => "info",
        1 => "info,driftvault=debug",
        2 => "debug",
        3 => "debug,driftvault=trace",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(true);

    if let Some(path) = &args.log_file {
        let (writer, guard) = build_file_writer(path)?;
        Box::leak(Box::new(guard));
        subscriber.json().with_writer(writer).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

fn build_file_writer(
    path: &std::path::Path,
) -> miette::Result<(tracing_appender::non_blocking::NonBlocking, tracing_appender::non_blocking::WorkerGuard)> {
    let (dir, prefix) = if path.is_dir() || path.as_os_str() == "." {
        (path.to_path_buf(), "driftvault.log".to_string())
    } else {
        (
            path.parent().unwrap_or(std::path::Path::new(".")).to_path_buf(),
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "driftvault.log".into()),
        )
    };

    let appender = tracing_appender::rolling::never(dir, prefix);
    Ok(tracing_appender::non_blocking(appender))
}
