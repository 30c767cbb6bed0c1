//! The run: `Index -> Extract -> Publish`.
//!
//! Each stage runs only when the one before it succeeded. Per-job failures
//! don't fail the extract stage; a store failure or a shutdown does.

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::PipelineError;
use crate::extract::RecordFilter;
use crate::fetch::{Fetch, RetryFetch};
use crate::models::{ExtractionJob, ExtractionResult, RunSummary};
use crate::outputs::publish_summary;
use crate::sink::{ResultSink, ResultStore, SinkReport};
use crate::sources::JobSource;
use crate::worker::{ParseOptions, WorkerContext};
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Results buffered per worker between the pool and the sink.
const RESULTS_PER_WORKER: usize = 2;

pub struct Pipeline<F> {
    pub source: Box<dyn JobSource>,
    pub fetcher: RetryFetch<F>,
    pub filter: RecordFilter,
    pub options: ParseOptions,
    pub concurrency: usize,
    pub shutdown_grace: Duration,
    pub output_dir: PathBuf,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl<F: Fetch + 'static> Pipeline<F> {
    /// Run all three stages, stopping at the first failure.
    #[instrument(level = "info", skip_all, fields(source = self.source.name()))]
    pub async fn run<S: ResultStore + 'static>(
        self,
        store: S,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let Pipeline {
            source,
            fetcher,
            filter,
            options,
            concurrency,
            shutdown_grace,
            output_dir,
            start_date,
            end_date,
        } = self;
        let started_at = Utc::now();
        let run_id = started_at.format("%Y%m%dT%H%M%S%3fZ").to_string();
        info!(%run_id, "Run starting");

        let t0 = Instant::now();
        let jobs = source.jobs().await.inspect_err(|e| {
            error!(error = %e, "Index stage failed");
        })?;
        info!(jobs = jobs.len(), elapsed_ms = t0.elapsed().as_millis(), "Index stage complete");

        let t0 = Instant::now();
        let (tx, rx) = mpsc::channel(concurrency.max(1) * RESULTS_PER_WORKER);
        let ctx = WorkerContext {
            fetcher,
            filter,
            options,
            results: tx,
            stop: CancellationToken::new(),
        };
        let (dispatch, sink) = extract(ctx, rx, concurrency, shutdown_grace, jobs, store, &shutdown)
            .await
            .inspect_err(|e| error!(error = %e, "Extract stage failed"))?;
        info!(elapsed_ms = t0.elapsed().as_millis(), "Extract stage complete");

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            start_date,
            end_date,
            jobs_succeeded: sink.succeeded,
            jobs_failed: sink.failed,
            jobs_skipped: dispatch.skipped_completed + dispatch.skipped_duplicate,
            counters: sink.counters,
            output_dir: output_dir.display().to_string(),
        };
        let latest = publish_summary(&output_dir, &summary)
            .await
            .map_err(PipelineError::Publish)
            .inspect_err(|e| error!(error = %e, "Publish stage failed"))?;
        info!(path = %latest.display(), "Publish stage complete");

        Ok(summary)
    }
}

/// Feed `jobs` through the worker pool into the store.
async fn extract<F: Fetch + 'static, S: ResultStore + 'static>(
    ctx: WorkerContext<F>,
    results: mpsc::Receiver<ExtractionResult>,
    concurrency: usize,
    shutdown_grace: Duration,
    jobs: Vec<ExtractionJob>,
    store: S,
    shutdown: &CancellationToken,
) -> Result<(DispatchReport, SinkReport), PipelineError> {
    let dispatcher = Dispatcher::new(Arc::new(ctx), concurrency, shutdown.clone(), shutdown_grace)?;

    let mut sink = ResultSink::new(store);
    let completed = sink.store().completed_jobs();
    let sink_task = tokio::spawn(async move { sink.run(results).await });

    let dispatch = dispatcher.run(jobs, &completed).await;
    let sink_report = sink_task
        .await
        .map_err(|e| PipelineError::SinkTask(e.to_string()))??;

    if shutdown.is_cancelled() {
        return Err(PipelineError::Interrupted);
    }
    Ok((dispatch, sink_report))
}
