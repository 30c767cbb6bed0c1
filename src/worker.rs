//! Extraction workers.
//!
//! A [`Worker`] takes one [`ExtractionJob`] at a time through
//!
//! ```text
//! Idle -> Fetching -> Parsing -> Emitting -> Idle
//!             \_________________/^
//!               fetch failure
//! ```
//!
//! Fetching downloads the WARC (with bounded retries); parsing walks its
//! records on the blocking pool; emitting sends exactly one
//! [`ExtractionResult`] to the result sink. Parse failures are terminal.

use crate::error::{FetchError, ParseError};
use crate::extract::{RecordFilter, RecordOutcome};
use crate::fetch::{Fetch, RetryFetch};
use crate::models::{ExtractedContent, ExtractionJob, ExtractionResult, JobCounters, JobId};
use crate::warc::open_warc;
use chrono::{NaiveDate, Utc};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Failure reason of jobs stopped by shutdown.
pub const CANCELLED: &str = "cancelled";

/// Where a worker is in processing its current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Parsing,
    Emitting,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Parsing)
                | (Fetching, Emitting)
                | (Parsing, Emitting)
                | (Emitting, Idle)
        )
    }
}

/// Per-record parsing options.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Stop after this many records.
    pub limit: Option<u64>,
    /// Log counters and progress every this many records.
    pub report_every: u64,
}

/// Everything the workers of one pool share.
pub struct WorkerContext<F> {
    pub fetcher: RetryFetch<F>,
    pub filter: RecordFilter,
    pub options: ParseOptions,
    pub results: mpsc::Sender<ExtractionResult>,
    /// Fired when in-flight jobs must stop (shutdown grace period expired).
    pub stop: CancellationToken,
}

pub struct Worker<F> {
    id: usize,
    state: WorkerState,
    ctx: Arc<WorkerContext<F>>,
}

impl<F: Fetch + 'static> Worker<F> {
    pub fn new(id: usize, ctx: Arc<WorkerContext<F>>) -> Self {
        Worker {
            id,
            state: WorkerState::Idle,
            ctx,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        // a bug in run(), never a property of the input
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid worker state transition {:?} -> {:?}",
            self.state,
            next
        );
        if !self.state.can_transition_to(next) {
            error!(worker = self.id, from = ?self.state, to = ?next, "Invalid worker state transition refused");
            return;
        }
        debug!(worker = self.id, from = ?self.state, to = ?next, "Worker state");
        self.state = next;
    }

    /// Process one job and emit its result.
    ///
    /// Returns `false` when the result could not be delivered because the
    /// sink has shut down.
    #[instrument(level = "info", skip_all, fields(worker = self.id, job = %job.id))]
    pub async fn run(&mut self, mut job: ExtractionJob) -> bool {
        let t0 = Instant::now();
        self.transition(WorkerState::Fetching);

        let result = match self.ctx.fetcher.fetch(&mut job, &self.ctx.stop).await {
            Err(FetchError::Cancelled) => {
                warn!("Fetch cancelled");
                ExtractionResult::failed(&job, CANCELLED)
            }
            Err(e) => {
                warn!(error = %e, attempts = job.retry_count + 1, "Fetch failed");
                ExtractionResult::failed(&job, format!("fetch failed: {e}"))
            }
            Ok(fetched) => {
                self.transition(WorkerState::Parsing);
                let date_crawled = job
                    .date_crawled
                    .map(|d| d.date())
                    .unwrap_or_else(|| Utc::now().date_naive());

                let ctx = Arc::clone(&self.ctx);
                let path = fetched.path.clone();
                let job_id = job.id.clone();
                let size = fetched.size;
                let parsed = tokio::task::spawn_blocking(move || {
                    parse_warc(&job_id, &path, size, date_crawled, &ctx.filter, ctx.options, &ctx.stop)
                })
                .await;
                fetched.cleanup();

                match parsed {
                    Ok(Ok(content)) => {
                        info!(counters = %content.counters, "Extraction finished");
                        ExtractionResult::success(&job, content)
                    }
                    Ok(Err(ParseError::Cancelled)) => {
                        warn!("Parsing cancelled");
                        ExtractionResult::failed(&job, CANCELLED)
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Parsing failed");
                        ExtractionResult::failed(&job, format!("parse failed: {e}"))
                    }
                    Err(e) => {
                        error!(error = %e, "Parser task panicked");
                        ExtractionResult::failed(&job, format!("parser task failed: {e}"))
                    }
                }
            }
        };

        self.transition(WorkerState::Emitting);
        let delivered = match self.ctx.results.send(result).await {
            Ok(()) => true,
            Err(_) => {
                error!("Result sink is gone; dropping result");
                false
            }
        };
        debug!(elapsed_ms = t0.elapsed().as_millis(), "Job done");
        self.transition(WorkerState::Idle);
        delivered
    }
}

/// Walk every record of a WARC file and extract its articles.
pub fn parse_warc(
    job_id: &JobId,
    path: &Path,
    file_size: Option<u64>,
    date_crawled: NaiveDate,
    filter: &RecordFilter,
    options: ParseOptions,
    stop: &CancellationToken,
) -> Result<ExtractedContent, ParseError> {
    let (reader, consumed) = open_warc(path)?;
    let start = Instant::now();
    let report_every = options.report_every.max(1);
    let mut content = ExtractedContent::default();
    info!(job = %job_id, "Iterating through records");

    for (i, record) in (0u64..).zip(reader) {
        if stop.is_cancelled() {
            return Err(ParseError::Cancelled);
        }
        if options.limit.is_some_and(|limit| i >= limit) {
            info!(job = %job_id, limit = i, "Passed limit. Stopping.");
            break;
        }
        if i != 0 && i % report_every == 0 {
            report_counters(job_id, &content.counters);
            report_progress(job_id, start, consumed.load(Ordering::Relaxed), file_size);
        }

        let record = record?;
        match filter.process(&record, date_crawled) {
            RecordOutcome::Discarded => {
                content.counters.discarded += 1;
            }
            RecordOutcome::Errored(e) => {
                debug!(job = %job_id, url = record.target_uri().unwrap_or_default(), error = %e, "Record errored");
                content.counters.errored += 1;
            }
            RecordOutcome::Extracted(article) => {
                content.articles.push(article);
                content.counters.extracted += 1;
            }
        }
    }

    Ok(content)
}

fn report_counters(job_id: &JobId, counters: &JobCounters) {
    info!(job = %job_id, "Counter Update {counters}");
}

/// Estimated completion, from how much of the on-disk file has been read.
pub(crate) fn progress_estimate(elapsed_minutes: f64, offset: u64, file_size: u64) -> Option<(f64, f64)> {
    if file_size == 0 || offset == 0 {
        return None;
    }
    let percent_complete = (100.0 * offset as f64 / file_size as f64).min(100.0);
    let minutes_left = elapsed_minutes * (100.0 - percent_complete) / percent_complete;
    Some((percent_complete, minutes_left))
}

fn report_progress(job_id: &JobId, start: Instant, offset: u64, file_size: Option<u64>) {
    let minutes = start.elapsed().as_secs_f64() / 60.0;
    match file_size.and_then(|size| progress_estimate(minutes, offset, size)) {
        Some((percent, minutes_left)) => {
            info!(job = %job_id, "Extraction {percent:.2}% complete. ~{minutes_left:.0} mins left.")
        }
        None => debug!(job = %job_id, "Filesize unknown, cannot report progress."),
    }
}
