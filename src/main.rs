use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ncm_dump::batch;
use ncm_dump::cover::HttpCoverFetcher;
use ncm_dump::Unboxer;

const LOG_ENV: &str = "NCM_LOG";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
enum Cli {
    /// Recover the audio inside one or more ncm files
    Unboxing(Unboxing),
}

#[derive(Debug, Args)]
struct Unboxing {
    /// Files or directories holding .ncm files
    #[arg(required = true)]
    input: Vec<PathBuf>,

    /// Output directory, defaults to the directory of each input
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Files processed at the same time
    #[arg(short, long)]
    jobs: Option<NonZeroUsize>,

    /// Never download cover art, store its URL instead
    #[arg(long)]
    no_cover_fetch: bool,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let Cli::Unboxing(unboxing) = Cli::parse();

    init_tracing(unboxing.verbose);

    match run(unboxing) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Returns whether every file was recovered.
fn run(unboxing: Unboxing) -> anyhow::Result<bool> {
    let files = batch::collect_inputs(&unboxing.input);
    if files.is_empty() {
        bail!("no .ncm files found");
    }

    if let Some(output) = &unboxing.output {
        std::fs::create_dir_all(output)
            .with_context(|| format!("cannot create output directory {}", output.display()))?;
    }

    let mut unboxer = Unboxer::default();
    if !unboxing.no_cover_fetch {
        match HttpCoverFetcher::new() {
            Ok(fetcher) => unboxer = unboxer.with_cover_fetcher(Box::new(fetcher)),
            Err(e) => warn!(error = %e, "cover download disabled"),
        }
    }
    // The last reference must be dropped outside the runtime, the blocking HTTP client owns one itself.
    let unboxer = Arc::new(unboxer);

    let jobs = unboxing
        .jobs
        .or_else(|| std::thread::available_parallelism().ok())
        .map_or(1, NonZeroUsize::get);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start runtime")?;

    let total = files.len();
    let reports = runtime.block_on(batch::run(Arc::clone(&unboxer), files, unboxing.output, jobs));
    drop(runtime);

    let failed = total - reports.iter().filter(|report| report.result.is_ok()).count();
    info!(total, failed, "done");

    Ok(failed == 0)
}
