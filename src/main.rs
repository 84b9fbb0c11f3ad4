use anyhow::{Context, Result};
use clap::Parser;
use perfalert::analysis::Analysis;
use perfalert::cli::Cli;
use perfalert::config::AnalysisConfig;
use perfalert::pushlog::{HgPushLog, OfflinePushLog, PushLogSource};
use perfalert::runner::{NotifyEvent, RunOptions};
use perfalert::source::JsonDirSource;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber on stderr; RUST_LOG overrides the flags
fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else if quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Load the configuration; relative store paths resolve next to the file
///
/// Validation happens when the analysis is opened.
fn load_config(path: &Path) -> Result<AnalysisConfig> {
    let mut config = AnalysisConfig::from_file(path)?;
    if let Some(dir) = path.parent() {
        config.cache = config.cache.rooted_at(dir);
    }
    Ok(config)
}

fn pushlog_source(config: &AnalysisConfig) -> Result<Box<dyn PushLogSource>> {
    match &config.pushlog.base_url {
        Some(url) => {
            let client = HgPushLog::new(
                url.clone(),
                Duration::from_secs(config.pushlog.timeout_secs),
                config.repo_paths(),
            )
            .context("failed to build push log client")?;
            Ok(Box::new(client))
        }
        None => {
            tracing::info!("No push log configured, using arrival order");
            Ok(Box::new(OfflinePushLog))
        }
    }
}

fn write_events(out: &mut dyn Write, events: &[NotifyEvent]) -> Result<()> {
    for event in events {
        serde_json::to_writer(&mut *out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose, args.quiet);

    // Configuration errors are the only fatal ones
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load configuration {}", args.config.display()))?;
    if args.jobs == Some(0) {
        anyhow::bail!("Invalid value for --jobs: 0 (must be >= 1)");
    }

    let now = perfalert::unix_now();
    let source = JsonDirSource::new(&args.data_dir);
    let pushlog = pushlog_source(&config)?;
    let mut analysis = Analysis::open(config, source, pushlog, now)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;

    let series = match analysis.list_series(&args.branches, &args.tests) {
        Ok(series) => series,
        Err(e) => {
            tracing::error!("Couldn't list series: {}", e);
            Vec::new()
        }
    };

    let opts = RunOptions {
        start_time: args
            .start_time
            .unwrap_or_else(|| analysis.default_start_time(now)),
        now,
        catchup: args.catchup,
        jobs: args.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }),
    };

    let summary = analysis.run(&series, &opts)?;

    let written = match &args.output {
        Some(path) => File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))
            .and_then(|file| write_events(&mut BufWriter::new(file), &summary.events)),
        None => write_events(&mut io::stdout().lock(), &summary.events),
    };
    if let Err(e) = written {
        tracing::error!("Error writing events: {:#}", e);
    }

    // Failures are logged inside; the next run only loses the update
    let _ = analysis.save();

    Ok(())
}
