//! # Article Extractor
//!
//! Extracts news articles from CommonCrawl's CC-NEWS web archives and
//! stores them as partitioned JSON lines.
//!
//! ## Features
//!
//! - Finds CC-NEWS WARC files for a date window from the monthly
//!   `warc.paths.gz` indexes, or reads them from a manifest file
//! - Downloads WARCs with bounded retries and exponential backoff
//! - Keeps HTML responses whose URL matches the configured glob patterns and
//!   extracts title, text, publish date and language
//! - Writes articles Hive-partitioned (by crawl date and language by
//!   default), plus a job ledger that lets interrupted runs resume
//!
//! ## Usage
//!
//! ```sh
//! article_extractor -o ./out --start-date 2022-04-01 --end-date 2022-04-02 -p '*bbc.co.uk*'
//! ```
//!
//! ## Architecture
//!
//! Every run is three stages; a stage only runs if the one before it
//! succeeded:
//! 1. **Index**: list the WARC files to process
//! 2. **Extract**: a bounded worker pool fetches and parses each WARC and
//!    sends one result per file to a single sink that writes the store
//! 3. **Publish**: write the run summary to `runs/` and `latest.json`

use chrono::Utc;
use clap::Parser;
use std::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod dispatcher;
mod error;
mod extract;
mod fetch;
mod models;
mod outputs;
mod pipeline;
mod sink;
mod sources;
mod utils;
mod warc;
mod worker;

use cli::Cli;
use config::{Settings, SourceSettings};
use extract::RecordFilter;
use fetch::{HttpFetcher, RetryFetch, build_client};
use outputs::JsonlStore;
use pipeline::Pipeline;
use sources::{CcNewsSource, JobSource, ManifestSource};
use utils::ensure_writable_dir;
use worker::ParseOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("article_extractor starting up");

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");
    let settings = Settings::load(&args, Utc::now().date_naive())?;
    info!(
        output_dir = %settings.output_dir.display(),
        concurrency = settings.concurrency,
        patterns = ?settings.patterns,
        "Resolved settings"
    );

    // Early check: the output dir must be writable before any download starts
    if let Err(e) = ensure_writable_dir(&settings.output_dir).await {
        error!(
            path = %settings.output_dir.display(),
            error = %e,
            "Output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let client = build_client(settings.request_timeout)?;
    let source: Box<dyn JobSource> = match &settings.source {
        SourceSettings::CcNews { start, end, domain } => {
            info!(%start, %end, %domain, "Reading jobs from CC-NEWS");
            Box::new(CcNewsSource::new(client.clone(), domain.clone(), *start, *end))
        }
        SourceSettings::Manifest(path) => {
            info!(path = %path.display(), "Reading jobs from manifest");
            Box::new(ManifestSource::new(path.clone()))
        }
    };

    let fetcher = RetryFetch::new(
        HttpFetcher::new(client, &settings.scratch_dir, settings.request_timeout),
        settings.max_attempts,
        settings.base_delay,
        settings.max_delay,
    );
    let store = JsonlStore::open(&settings.output_dir, &settings.partitions, settings.batch_size).await?;

    // ---- Shutdown on Ctrl-C ----
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; finishing in-flight jobs");
                shutdown.cancel();
            }
        }
    });

    let pipeline = Pipeline {
        source,
        fetcher,
        filter: RecordFilter::new(&settings.patterns)?,
        options: ParseOptions {
            limit: settings.limit,
            report_every: settings.report_every,
        },
        concurrency: settings.concurrency,
        shutdown_grace: settings.shutdown_grace,
        output_dir: settings.output_dir.clone(),
        start_date: settings.start_date(),
        end_date: settings.end_date(),
    };

    let summary = match pipeline.run(store, shutdown).await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, elapsed_secs = start_time.elapsed().as_secs(), "Run failed");
            return Err(e.into());
        }
    };

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        run_id = %summary.run_id,
        jobs_succeeded = summary.jobs_succeeded,
        jobs_failed = summary.jobs_failed,
        jobs_skipped = summary.jobs_skipped,
        "Execution complete. {}",
        summary.counters
    );

    Ok(())
}
