//! Run configuration.
//!
//! Settings come from three layers, highest priority first:
//!
//! 1. command-line flags ([`Cli`])
//! 2. the YAML file given with `--config` ([`FileConfig`])
//! 3. built-in defaults
//!
//! [`Settings::resolve`] merges them and validates the result.
//!
//! # Example file
//!
//! ```yaml
//! output_dir: /data/articles
//! start_date: 2022-04-01
//! end_date: 2022-04-08
//! patterns:
//!   - "*bbc.co.uk*"
//!   - "*reuters.com*"
//! concurrency: 8
//! partitions: [date_crawled, language]
//! ```

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::models::Article;
use crate::sources::cc_news::CC_DOMAIN;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_REPORT_EVERY: u64 = 5000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_PARTITIONS: [&str; 2] = ["date_crawled", "language"];
const SCRATCH_DIR: &str = ".scratch";

/// Contents of the YAML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub manifest: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub limit: Option<u64>,
    pub report_every: Option<u64>,
    pub max_attempts: Option<u32>,
    pub scratch_dir: Option<PathBuf>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub partitions: Option<Vec<String>>,
    pub batch_size: Option<usize>,
    pub cc_domain: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(FileConfig::default());
        }
        serde_yaml::from_str(text)
    }
}

/// Where the jobs of a run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSettings {
    /// CC-NEWS WARCs crawled in `[start, end)`.
    CcNews {
        start: NaiveDate,
        end: NaiveDate,
        domain: String,
    },
    Manifest(PathBuf),
}

/// Validated settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub source: SourceSettings,
    pub patterns: Vec<String>,
    pub concurrency: usize,
    pub limit: Option<u64>,
    pub report_every: u64,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub partitions: Vec<String>,
    pub batch_size: usize,
}

impl Settings {
    /// Read the config file named by `cli` (if any) and resolve against it.
    pub fn load(cli: &Cli, today: NaiveDate) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                info!(path = %path.display(), "Loading config file");
                FileConfig::load(path)?
            }
            None => FileConfig::default(),
        };
        Self::resolve(cli, file, today)
    }

    /// Merge CLI flags over file values over defaults, then validate.
    pub fn resolve(cli: &Cli, file: FileConfig, today: NaiveDate) -> Result<Self, ConfigError> {
        let output_dir = cli
            .output_dir
            .clone()
            .or(file.output_dir)
            .ok_or_else(|| invalid("an output directory is required (--output-dir)"))?;
        let scratch_dir = cli
            .scratch_dir
            .clone()
            .or(file.scratch_dir)
            .unwrap_or_else(|| output_dir.join(SCRATCH_DIR));

        let patterns = if cli.patterns.is_empty() {
            file.patterns
        } else {
            cli.patterns.clone()
        };
        for pattern in &patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| invalid(format!("bad URL pattern {pattern:?}: {e}")))?;
        }
        if patterns.is_empty() {
            warn!("No URL patterns configured; every record will be discarded");
        }

        let start_date = cli.start_date.or(file.start_date);
        let end_date = cli.end_date.or(file.end_date);
        let source = match cli.manifest.clone().or(file.manifest) {
            Some(path) => {
                if start_date.is_some() || end_date.is_some() {
                    warn!("Dates are ignored when reading jobs from a manifest");
                }
                SourceSettings::Manifest(path)
            }
            None => {
                let start = start_date
                    .ok_or_else(|| invalid("a start date is required (--start-date) unless --manifest is given"))?;
                let end = end_date.unwrap_or(today);
                if end > today {
                    return Err(invalid(format!("end date {end} is in the future")));
                }
                if start >= end {
                    return Err(invalid(format!(
                        "start date {start} must be before end date {end}"
                    )));
                }
                SourceSettings::CcNews {
                    start,
                    end,
                    domain: file.cc_domain.unwrap_or_else(|| CC_DOMAIN.to_string()),
                }
            }
        };

        let concurrency = match cli.concurrency.or(file.concurrency) {
            Some(n) => n,
            None => available_parallelism().map(|n| n.get()).unwrap_or(1),
        };
        if concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }

        let report_every = cli
            .report_every
            .or(file.report_every)
            .unwrap_or(DEFAULT_REPORT_EVERY);
        if report_every == 0 {
            return Err(invalid("report_every must be at least 1"));
        }

        let max_attempts = cli
            .max_attempts
            .or(file.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }

        let batch_size = file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }

        let partitions = file
            .partitions
            .unwrap_or_else(|| DEFAULT_PARTITIONS.iter().map(|p| p.to_string()).collect());
        if let Some(unknown) = partitions.iter().find(|p| !Article::is_field(p)) {
            return Err(invalid(format!(
                "unknown partition {unknown:?}; expected one of {}",
                Article::FIELDS.join(", ")
            )));
        }

        let base_delay = Duration::from_millis(file.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS));
        let max_delay = Duration::from_millis(file.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS));
        if max_delay < base_delay {
            return Err(invalid("max_delay_ms must not be below base_delay_ms"));
        }

        Ok(Settings {
            output_dir,
            scratch_dir,
            source,
            patterns,
            concurrency,
            limit: cli.limit.or(file.limit),
            report_every,
            max_attempts,
            base_delay,
            max_delay,
            request_timeout: Duration::from_secs(
                file.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            shutdown_grace: Duration::from_secs(
                file.shutdown_grace_secs
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            partitions,
            batch_size,
        })
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        match &self.source {
            SourceSettings::CcNews { start, .. } => Some(*start),
            SourceSettings::Manifest(_) => None,
        }
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        match &self.source {
            SourceSettings::CcNews { end, .. } => Some(*end),
            SourceSettings::Manifest(_) => None,
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
