//! WARC download with exponential backoff retry logic.
//!
//! # Architecture
//!
//! - [`Fetch`]: core trait for getting a job's WARC onto local disk
//! - [`HttpFetcher`]: downloads `http(s)` URLs to a scratch directory and
//!   serves `file://` URLs and plain paths in place. A downloaded file is
//!   owned by the returned [`FetchedWarc`] and deleted when it is dropped,
//!   including when a download is abandoned halfway.
//! - [`RetryFetch`]: wraps any [`Fetch`] with bounded retries
//!
//! # Retry Strategy
//!
//! - 3 attempts in total by default
//! - Exponential backoff starting at 1 second, capped at 30 seconds
//! - Random jitter (0-250ms) added to prevent thundering herd
//! - Only errors for which [`FetchError::is_retryable`] holds are retried

use crate::error::FetchError;
use crate::models::ExtractionJob;
use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// A WARC file available on local disk.
#[derive(Debug)]
pub struct FetchedWarc {
    pub path: PathBuf,
    /// On-disk size in bytes, used for progress reports.
    pub size: Option<u64>,
    /// Set when the file was downloaded for this job; removes it on drop.
    pub scratch: Option<TempPath>,
}

impl FetchedWarc {
    /// A file that already existed and is left in place.
    pub fn in_place(path: impl Into<PathBuf>, size: Option<u64>) -> Self {
        FetchedWarc {
            path: path.into(),
            size,
            scratch: None,
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.scratch.is_some()
    }

    /// Remove the file if it was downloaded for this job.
    pub fn cleanup(self) {
        if let Some(scratch) = self.scratch {
            if let Err(e) = scratch.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch file");
            }
        }
    }
}

/// Gets a job's WARC file onto local disk.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, job: &ExtractionJob) -> Result<FetchedWarc, FetchError>;
}

/// Build the shared HTTP client.
pub fn build_client(connect_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Fetcher for `http(s)` URLs, `file://` URLs and local paths.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    scratch_dir: PathBuf,
    /// Longest wait for the response head or any single body chunk.
    read_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(client: Client, scratch_dir: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        HttpFetcher {
            client,
            scratch_dir: scratch_dir.into(),
            read_timeout,
        }
    }

    async fn local(&self, url: &str, path: PathBuf) -> Result<FetchedWarc, FetchError> {
        let meta = fs::metadata(&path).await.map_err(|source| FetchError::Io {
            url: url.to_string(),
            source,
        })?;
        Ok(FetchedWarc::in_place(path, Some(meta.len())))
    }

    async fn download(&self, job: &ExtractionJob) -> Result<FetchedWarc, FetchError> {
        let url = job.source_url.as_str();
        let io_err = |source: std::io::Error| FetchError::Io {
            url: url.to_string(),
            source,
        };
        let timed_out = || {
            io_err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for data",
            ))
        };

        let mut response = timeout(self.read_timeout, self.client.get(url).send())
            .await
            .map_err(|_| timed_out())?
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let content_length = response.content_length();

        fs::create_dir_all(&self.scratch_dir).await.map_err(io_err)?;
        let part = tempfile::Builder::new()
            .prefix(&format!("{}.", job.id))
            .suffix(".warc.part")
            .tempfile_in(&self.scratch_dir)
            .map_err(io_err)?;
        // `guard` deletes the partial file if this future errors or is dropped
        let (std_file, guard) = part.into_parts();
        let mut file = fs::File::from_std(std_file);

        let mut written: u64 = 0;
        loop {
            let chunk = timeout(self.read_timeout, response.chunk())
                .await
                .map_err(|_| timed_out())?
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        let path = self.scratch_dir.join(format!("{}.warc", job.id));
        guard.persist(&path).map_err(|e| io_err(e.error))?;
        debug!(bytes = written, path = %path.display(), "Downloaded WARC");

        Ok(FetchedWarc {
            scratch: Some(TempPath::from_path(&path)),
            size: content_length.or(Some(written)),
            path,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    #[instrument(level = "info", skip_all, fields(job = %job.id))]
    async fn fetch(&self, job: &ExtractionJob) -> Result<FetchedWarc, FetchError> {
        let url = job.source_url.as_str();
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.download(job).await;
        }
        if url.starts_with("file://") {
            let path = Url::parse(url)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| FetchError::UnsupportedUrl(url.to_string()))?;
            return self.local(url, path).await;
        }
        if url.contains("://") {
            return Err(FetchError::UnsupportedUrl(url.to_string()));
        }
        self.local(url, Path::new(url).to_path_buf()).await
    }
}

/// Adds bounded exponential-backoff retries to any [`Fetch`].
///
/// The delay before retry `n` (1-based) is
/// ```text
/// delay = min(base_delay * 2^(n-1), max_delay) + random_jitter(0..=jitter)
/// ```
#[derive(Debug, Clone)]
pub struct RetryFetch<T> {
    inner: T,
    /// Total attempts, including the first.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl<T: Fetch> RetryFetch<T> {
    pub fn new(inner: T, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryFetch {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: Duration::from_millis(250),
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Fetch the job's WARC, retrying transient failures.
    ///
    /// Each retry increments `job.retry_count`. Cancelling `cancel` aborts
    /// the attempt in flight and any pending backoff.
    #[instrument(level = "info", skip_all, fields(job = %job.id))]
    pub async fn fetch(
        &self,
        job: &mut ExtractionJob,
        cancel: &CancellationToken,
    ) -> Result<FetchedWarc, FetchError> {
        let total_t0 = Instant::now();

        loop {
            let attempt_t0 = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                res = self.inner.fetch(job) => res,
            };

            let e = match outcome {
                Ok(fetched) => {
                    info!(
                        attempts = job.retry_count + 1,
                        elapsed_ms_total = total_t0.elapsed().as_millis(),
                        "WARC fetched"
                    );
                    return Ok(fetched);
                }
                Err(e) => e,
            };

            let attempt = job.retry_count + 1;
            if !e.is_retryable() || attempt >= self.max_attempts {
                error!(
                    attempt,
                    max = self.max_attempts,
                    retryable = e.is_retryable(),
                    elapsed_ms_total = total_t0.elapsed().as_millis(),
                    error = %e,
                    "fetch() giving up"
                );
                return Err(e);
            }

            job.retry_count += 1;
            let jitter_ms: u64 = rng().random_range(0..=self.jitter.as_millis() as u64);
            let delay = self.backoff(job.retry_count) + Duration::from_millis(jitter_ms);

            warn!(
                attempt,
                max = self.max_attempts,
                elapsed_ms_attempt = attempt_t0.elapsed().as_millis(),
                ?delay,
                error = %e,
                "fetch() attempt failed; backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
