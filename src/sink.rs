//! Result sink: the single writer between the workers and the store.
//!
//! Workers send [`ExtractionResult`]s over an mpsc channel; the sink
//! receives them one at a time, so writes to the [`ResultStore`] are
//! serialized. A job id is written at most once per run, and never again
//! once the store has recorded it as successful.

use crate::error::StoreError;
use crate::models::{ExtractionResult, JobCounters, JobId, JobStatus};
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Persistence for job results.
#[async_trait]
pub trait ResultStore: Send {
    /// Ids of jobs already recorded as successful.
    fn completed_jobs(&self) -> HashSet<JobId>;

    /// Persist a result, replacing anything stored under the same job id.
    async fn upsert(&mut self, result: &ExtractionResult) -> Result<(), StoreError>;

    async fn flush(&mut self) -> Result<(), StoreError>;
}

/// What the sink persisted over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub succeeded: u64,
    pub failed: u64,
    /// Results dropped because their job id was already written.
    pub duplicates: u64,
    pub counters: JobCounters,
}

pub struct ResultSink<S> {
    store: S,
    written: HashSet<JobId>,
}

impl<S: ResultStore> ResultSink<S> {
    /// Job ids the store already completed count as written.
    pub fn new(store: S) -> Self {
        let written = store.completed_jobs();
        ResultSink { store, written }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Drain `results` until every sender is gone.
    ///
    /// A store error stops the sink immediately; dropping the receiver is
    /// what tells the workers and dispatcher to stop.
    #[instrument(level = "info", skip_all)]
    pub async fn run(
        &mut self,
        mut results: mpsc::Receiver<ExtractionResult>,
    ) -> Result<SinkReport, StoreError> {
        let mut report = SinkReport::default();

        while let Some(result) = results.recv().await {
            if self.written.contains(&result.job_id) {
                warn!(job = %result.job_id, "Duplicate result for job; not persisting");
                report.duplicates += 1;
                continue;
            }

            self.store.upsert(&result).await?;
            self.written.insert(result.job_id.clone());

            match &result.status {
                JobStatus::Success => {
                    report.succeeded += 1;
                    report.counters += result.content.counters;
                    info!(
                        job = %result.job_id,
                        articles = result.content.articles.len(),
                        attempts = result.attempts,
                        "Persisted job"
                    );
                }
                JobStatus::Failed(reason) => {
                    report.failed += 1;
                    warn!(
                        job = %result.job_id,
                        attempts = result.attempts,
                        reason = %truncate_for_log(reason, 300),
                        "Persisted failed job"
                    );
                }
            }
        }

        self.store.flush().await?;
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            duplicates = report.duplicates,
            "Run totals {}",
            report.counters
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ExtractedContent, ExtractionJob};

    /// In-memory store; fails the upsert of `fail_on` if set.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub results: Vec<ExtractionResult>,
        pub completed: HashSet<JobId>,
        pub fail_on: Option<JobId>,
        pub flushes: usize,
    }

    #[async_trait]
    impl ResultStore for MemoryStore {
        fn completed_jobs(&self) -> HashSet<JobId> {
            self.completed.clone()
        }

        async fn upsert(&mut self, result: &ExtractionResult) -> Result<(), StoreError> {
            if self.fail_on.as_ref() == Some(&result.job_id) {
                return Err(StoreError::io(
                    "/memory",
                    std::io::Error::other("disk full"),
                ));
            }
            self.results.push(result.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), StoreError> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn success(url: &str, extracted: u64) -> ExtractionResult {
        let mut content = ExtractedContent::default();
        content.counters.extracted = extracted;
        ExtractionResult::success(&ExtractionJob::new(url), content)
    }

    #[tokio::test]
    async fn test_sink_persists_each_job_once() {
        let (tx, rx) = mpsc::channel(8);
        let mut sink = ResultSink::new(MemoryStore::default());

        tx.send(success("/data/a.warc", 2)).await.unwrap();
        tx.send(success("/data/b.warc", 3)).await.unwrap();
        tx.send(success("/data/a.warc", 7)).await.unwrap();
        tx.send(ExtractionResult::failed(&ExtractionJob::new("/data/c.warc"), "HTTP 404"))
            .await
            .unwrap();
        drop(tx);

        let report = sink.run(rx).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.counters.extracted, 5);

        let store = sink.into_store();
        assert_eq!(store.results.len(), 3);
        assert_eq!(store.flushes, 1);
    }

    #[tokio::test]
    async fn test_sink_skips_jobs_the_store_completed() {
        let store = MemoryStore {
            completed: HashSet::from([JobId::from("a")]),
            ..MemoryStore::default()
        };
        let (tx, rx) = mpsc::channel(4);
        let mut sink = ResultSink::new(store);
        tx.send(success("/data/a.warc", 1)).await.unwrap();
        drop(tx);

        let report = sink.run(rx).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert!(sink.store().results.is_empty());
    }

    #[tokio::test]
    async fn test_store_error_stops_the_sink() {
        let store = MemoryStore {
            fail_on: Some(JobId::from("b")),
            ..MemoryStore::default()
        };
        let (tx, rx) = mpsc::channel(4);
        let mut sink = ResultSink::new(store);
        tx.send(success("/data/a.warc", 1)).await.unwrap();
        tx.send(success("/data/b.warc", 1)).await.unwrap();
        tx.send(success("/data/c.warc", 1)).await.unwrap();

        assert!(sink.run(rx).await.is_err());
        assert_eq!(sink.store().results.len(), 1);
        // the receiver is gone, so senders notice
        assert!(tx.is_closed());
    }
}
