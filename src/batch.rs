//! Batch mode: a set of independent books under one host-capacity bound.
//!
//! Each book has its own state document and lock; cross-book coordination
//! is limited to the shared semaphore and the append-only logs. Books that
//! fail do not stop the batch.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::{CliOverrides, Config};
use crate::orchestrator::{Orchestrator, RunOutcome};

/// Result of one book in a batch.
#[derive(Debug)]
pub struct BookResult {
    pub input: PathBuf,
    pub outcome: Result<RunOutcome, String>,
}

/// Terminal summary of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BookResult>,
}

impl BatchSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            crate::errors::exit::SUCCESS
        } else {
            crate::errors::exit::FAILURE
        }
    }
}

/// Effective parallelism: the configured value, or the CPU count when 0.
fn effective_parallelism(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Run the pipeline over every input, at most `max_parallel` at a time.
pub async fn run_batch(
    inputs: Vec<PathBuf>,
    cli: CliOverrides,
    max_parallel: usize,
    verbose: bool,
) -> Result<BatchSummary> {
    let parallelism = effective_parallelism(max_parallel);
    info!(books = inputs.len(), parallelism, "batch starting");

    let progress = ProgressBar::new(inputs.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let semaphore = Arc::new(Semaphore::new(parallelism));
    let mut handles = Vec::with_capacity(inputs.len());
    for input in inputs {
        let semaphore = Arc::clone(&semaphore);
        let cli = cli.clone();
        let progress = progress.clone();
        handles.push(tokio::spawn(async move {
            // Closed semaphore never happens here; treat it as a skip.
            let Ok(_permit) = semaphore.acquire().await else {
                return BookResult {
                    input,
                    outcome: Err("semaphore closed".into()),
                };
            };
            progress.set_message(
                input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            let outcome = run_one(&input, cli, verbose).await;
            progress.inc(1);
            BookResult { input, outcome }
        }));
    }

    let mut summary = BatchSummary::default();
    for joined in join_all(handles).await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "batch worker panicked");
                summary.failed += 1;
                summary.total += 1;
                continue;
            }
        };
        summary.total += 1;
        match &result.outcome {
            Ok(RunOutcome::Success) => summary.succeeded += 1,
            Ok(_) | Err(_) => summary.failed += 1,
        }
        summary.results.push(result);
    }
    progress.finish_and_clear();

    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "batch finished"
    );
    Ok(summary)
}

async fn run_one(input: &PathBuf, cli: CliOverrides, verbose: bool) -> Result<RunOutcome, String> {
    let config = Config::for_input(input.clone(), None, cli, verbose).map_err(|e| e.to_string())?;
    let mut orchestrator = Orchestrator::new(config).map_err(|e| e.to_string())?;
    match orchestrator.run().await {
        Ok(report) => Ok(report.outcome),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_parallelism() {
        assert_eq!(effective_parallelism(4), 4);
        assert!(effective_parallelism(0) >= 1);
    }

    #[test]
    fn test_summary_exit_code() {
        let mut summary = BatchSummary {
            total: 2,
            succeeded: 2,
            failed: 0,
            results: Vec::new(),
        };
        assert_eq!(summary.exit_code(), 0);
        summary.failed = 1;
        assert_eq!(summary.exit_code(), 1);
    }
}
