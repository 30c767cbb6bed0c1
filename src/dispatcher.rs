//! Assigns jobs to a bounded pool of workers.
//!
//! Idle workers wait in a channel sized to the pool. Taking a worker out
//! blocks while every worker is busy, which is the backpressure on job
//! intake; a finished job puts its worker back.
//!
//! On shutdown the dispatcher stops taking jobs, waits up to the grace
//! period for in-flight jobs, then fires the workers' stop token so the
//! stragglers report `Failed("cancelled")`.

use crate::error::PipelineError;
use crate::fetch::Fetch;
use crate::models::{ExtractionJob, ExtractionResult, JobId};
use crate::worker::{Worker, WorkerContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How a batch of jobs was handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: u64,
    /// Already recorded as successful by an earlier run.
    pub skipped_completed: u64,
    /// Repeated job ids.
    pub skipped_duplicate: u64,
    /// Left in the queue when shutdown or a closed sink stopped intake.
    pub not_started: u64,
}

pub struct Dispatcher<F> {
    ctx: Arc<WorkerContext<F>>,
    concurrency: usize,
    shutdown: CancellationToken,
    grace: Duration,
}

impl<F: Fetch + 'static> Dispatcher<F> {
    /// Fails when the pool would have no workers.
    pub fn new(
        ctx: Arc<WorkerContext<F>>,
        concurrency: usize,
        shutdown: CancellationToken,
        grace: Duration,
    ) -> Result<Self, PipelineError> {
        if concurrency == 0 {
            return Err(PipelineError::Pool(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Dispatcher {
            ctx,
            concurrency,
            shutdown,
            grace,
        })
    }

    /// Run every job through the pool and wait for them to finish.
    #[instrument(level = "info", skip_all, fields(workers = self.concurrency, jobs = jobs.len()))]
    pub async fn run(self, jobs: Vec<ExtractionJob>, completed: &HashSet<JobId>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let (idle_tx, mut idle_rx) = mpsc::channel(self.concurrency);
        for id in 0..self.concurrency {
            // capacity equals the pool size, so this never waits
            let _ = idle_tx.send(Worker::new(id, Arc::clone(&self.ctx))).await;
        }
        let mut next_worker_id = self.concurrency;

        let mut tasks: JoinSet<bool> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, ExtractionJob> = HashMap::new();
        let mut seen: HashSet<JobId> = HashSet::new();
        let mut queue = jobs.into_iter();

        while let Some(job) = queue.next() {
            if self.shutdown.is_cancelled() || self.ctx.results.is_closed() {
                report.not_started = 1 + queue.by_ref().count() as u64;
                break;
            }
            if !seen.insert(job.id.clone()) {
                warn!(job = %job.id, url = %job.source_url, "Duplicate job id; dropping");
                report.skipped_duplicate += 1;
                continue;
            }
            if completed.contains(&job.id) {
                debug!(job = %job.id, "Already extracted; skipping");
                report.skipped_completed += 1;
                continue;
            }

            let idle = loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break None,
                    worker = idle_rx.recv() => break worker,
                    Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                        if let Some(job) = self.reap(joined, &mut in_flight).await {
                            // replace the worker lost with the job
                            let _ = idle_tx.send(Worker::new(next_worker_id, Arc::clone(&self.ctx))).await;
                            next_worker_id += 1;
                            debug!(job = %job.id, "Replaced worker");
                        }
                    }
                }
            };
            let Some(mut worker) = idle else {
                report.not_started = 1 + queue.by_ref().count() as u64;
                break;
            };

            debug!(job = %job.id, worker = worker.id(), state = ?worker.state(), "Dispatching job");
            report.dispatched += 1;
            let back = idle_tx.clone();
            let handle = tasks.spawn({
                let job = job.clone();
                async move {
                    let delivered = worker.run(job).await;
                    let _ = back.send(worker).await;
                    delivered
                }
            });
            in_flight.insert(handle.id(), job);
        }

        if report.not_started > 0 {
            warn!(not_started = report.not_started, "Stopped taking jobs");
        }
        self.drain(&mut tasks, &mut in_flight).await;

        info!(
            dispatched = report.dispatched,
            skipped_completed = report.skipped_completed,
            skipped_duplicate = report.skipped_duplicate,
            not_started = report.not_started,
            "Dispatch finished"
        );
        report
    }

    /// Wait for in-flight jobs, stopping them once the grace period after
    /// shutdown runs out.
    async fn drain(
        &self,
        tasks: &mut JoinSet<bool>,
        in_flight: &mut HashMap<tokio::task::Id, ExtractionJob>,
    ) {
        let graceful = tokio::select! {
            _ = self.join_all(tasks, in_flight) => true,
            _ = async {
                self.shutdown.cancelled().await;
                sleep(self.grace).await;
            } => false,
        };
        if !graceful {
            warn!(
                in_flight = tasks.len(),
                grace_secs = self.grace.as_secs(),
                "Shutdown grace period expired; stopping in-flight jobs"
            );
            self.ctx.stop.cancel();
            self.join_all(tasks, in_flight).await;
        }
    }

    async fn join_all(
        &self,
        tasks: &mut JoinSet<bool>,
        in_flight: &mut HashMap<tokio::task::Id, ExtractionJob>,
    ) {
        while let Some(joined) = tasks.join_next_with_id().await {
            self.reap(joined, in_flight).await;
        }
    }

    /// Account for a finished task. A panicked worker never emitted its
    /// result, so one is emitted here; the lost job is returned.
    async fn reap(
        &self,
        joined: Result<(tokio::task::Id, bool), JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, ExtractionJob>,
    ) -> Option<ExtractionJob> {
        match joined {
            Ok((id, delivered)) => {
                in_flight.remove(&id);
                if !delivered {
                    warn!("Result sink closed; results are being dropped");
                }
                None
            }
            Err(e) => {
                let job = in_flight.remove(&e.id())?;
                error!(job = %job.id, error = %e, "Worker task failed");
                let result = ExtractionResult::failed(&job, format!("worker task failed: {e}"));
                if self.ctx.results.send(result).await.is_err() {
                    error!(job = %job.id, "Result sink is gone; dropping result");
                }
                Some(job)
            }
        }
    }
}
