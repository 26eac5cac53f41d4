//! Input selection and concurrent execution of a batch. Files are fully
//! independent: a failure is reported for that file and the rest go on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn};

use crate::error::NcmError;
use crate::ncm::{Unboxed, Unboxer};

const NCM_EXTENSION: &str = "ncm";

#[derive(Debug)]
pub struct Report {
    pub input: PathBuf,
    pub result: Result<Unboxed, NcmError>,
}

fn is_ncm(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(NCM_EXTENSION))
}

/// Expands directories one level deep and keeps only `.ncm` files.
pub fn collect_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            let entries = match std::fs::read_dir(path) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "cannot read directory");
                    continue;
                }
            };

            let mut found: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|entry| entry.is_file())
                .filter(|entry| {
                    let keep = is_ncm(entry);
                    if !keep {
                        info!(path = %entry.display(), "skipping, not an ncm file");
                    }
                    keep
                })
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            if is_ncm(path) {
                files.push(path.clone());
            } else {
                info!(path = %path.display(), "skipping, not an ncm file");
            }
        } else {
            warn!(path = %path.display(), "input does not exist");
        }
    }

    files
}

/// Runs every file on the blocking pool, at most `jobs` at a time. Each file
/// goes to `output`, or next to its input when `output` is `None`.
pub async fn run(unboxer: Arc<Unboxer>, files: Vec<PathBuf>, output: Option<PathBuf>, jobs: usize) -> Vec<Report> {
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut tasks = JoinSet::new();

    for input in files {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        let unboxer = Arc::clone(&unboxer);
        let output_dir = output
            .clone()
            .or_else(|| input.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        tasks.spawn_blocking(move || {
            let _permit = permit;
            let span = info_span!("file", path = %input.display());
            let _enter = span.enter();

            let result = unboxer.unboxing(&input, &output_dir);
            if let Err(e) = &result {
                error!(error = %e, "failed");
            }
            Report { input, result }
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => error!(error = %e, "worker task died"),
        }
    }
    reports.sort_by(|a, b| a.input.cmp(&b.input));
    reports
}
