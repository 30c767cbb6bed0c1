//! Data models shared by the job sources, workers and the result sink.
//!
//! - [`ExtractionJob`]: one WARC file to download and extract
//! - [`Article`]: a single extracted news article
//! - [`JobCounters`]: extracted/discarded/errored record counts
//! - [`ExtractionResult`]: the terminal outcome of a job
//! - [`RunSummary`]: what a whole run produced

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

static WARC_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CC-NEWS-(?P<time>\d{14})-(?P<serial>\d{5})").unwrap());

/// Identifier of an extraction job: the WARC basename without extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive the job id from a WARC URL or path.
    ///
    /// `https://data.commoncrawl.org/.../CC-NEWS-20220401000546-00192.warc.gz`
    /// becomes `CC-NEWS-20220401000546-00192`.
    pub fn from_url(url: &str) -> Self {
        let trimmed = url.trim_end_matches('/');
        let file = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
        let base = file.split('.').next().unwrap_or(file);
        JobId(base.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// Parse the crawl timestamp out of a CC-NEWS WARC filename.
///
/// Returns `None` when the name doesn't follow
/// `CC-NEWS-<YYYYmmddHHMMSS>-<NNNNN>`.
pub fn crawl_date_from_path(path: &str) -> Option<NaiveDateTime> {
    let caps = WARC_FILE_RE.captures(path)?;
    NaiveDateTime::parse_from_str(&caps["time"], "%Y%m%d%H%M%S").ok()
}

/// A WARC file to extract articles from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: JobId,
    /// Absolute URL, `file://` URL, or local path of the WARC file.
    pub source_url: String,
    /// How many fetch attempts have been retried so far.
    pub retry_count: u32,
    /// When CommonCrawl published the WARC, if the filename says so.
    pub date_crawled: Option<NaiveDateTime>,
}

impl ExtractionJob {
    pub fn new(source_url: impl Into<String>) -> Self {
        let source_url = source_url.into();
        ExtractionJob {
            id: JobId::from_url(&source_url),
            date_crawled: crawl_date_from_path(&source_url),
            source_url,
            retry_count: 0,
        }
    }
}

/// An article extracted from one WARC response record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub main_text: String,
    pub url: String,
    /// `scheme://host` of the article URL.
    pub source_domain: String,
    /// `YYYY-MM-DD`, when the page declares a publish date.
    pub date_publish: Option<String>,
    /// `YYYY-MM-DD`
    pub date_crawled: String,
    /// ISO 639-3 code, e.g. `eng`.
    pub language: String,
}

impl Article {
    /// Field names usable as storage partition keys.
    pub const FIELDS: [&'static str; 7] = [
        "title",
        "main_text",
        "url",
        "source_domain",
        "date_publish",
        "date_crawled",
        "language",
    ];

    pub fn is_field(name: &str) -> bool {
        Self::FIELDS.iter().any(|field| *field == name)
    }

    /// Value of a field by name, for partitioning. `None` for unknown keys.
    pub fn field(&self, name: &str) -> Option<Option<&str>> {
        match name {
            "title" => Some(Some(&self.title)),
            "main_text" => Some(Some(&self.main_text)),
            "url" => Some(Some(&self.url)),
            "source_domain" => Some(Some(&self.source_domain)),
            "date_publish" => Some(self.date_publish.as_deref()),
            "date_crawled" => Some(Some(&self.date_crawled)),
            "language" => Some(Some(&self.language)),
            _ => None,
        }
    }
}

/// Record counts for a job, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub extracted: u64,
    pub discarded: u64,
    pub errored: u64,
}

impl JobCounters {
    pub fn total(&self) -> u64 {
        self.extracted + self.discarded + self.errored
    }
}

impl AddAssign for JobCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.extracted += rhs.extracted;
        self.discarded += rhs.discarded;
        self.errored += rhs.errored;
    }
}

impl fmt::Display for JobCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "extracted={} discarded={} errored={} total={}",
            self.extracted,
            self.discarded,
            self.errored,
            self.total()
        )
    }
}

/// Terminal status of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed(String),
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

/// Articles and counters a worker produced for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedContent {
    pub articles: Vec<Article>,
    pub counters: JobCounters,
}

/// The single terminal outcome of an [`ExtractionJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub job_id: JobId,
    pub source_url: String,
    pub content: ExtractedContent,
    /// Total fetch attempts made, including the first.
    pub attempts: u32,
    pub status: JobStatus,
}

impl ExtractionResult {
    pub fn success(job: &ExtractionJob, content: ExtractedContent) -> Self {
        ExtractionResult {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            content,
            attempts: job.retry_count + 1,
            status: JobStatus::Success,
        }
    }

    pub fn failed(job: &ExtractionJob, reason: impl Into<String>) -> Self {
        ExtractionResult {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            content: ExtractedContent::default(),
            attempts: job.retry_count + 1,
            status: JobStatus::Failed(reason.into()),
        }
    }
}

/// Status column of the job ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Success,
    Failed,
}

/// One line of the job ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub source_url: String,
    pub status: LedgerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
    pub counters: JobCounters,
    pub recorded_at: DateTime<Utc>,
}

impl From<&ExtractionResult> for LedgerEntry {
    fn from(result: &ExtractionResult) -> Self {
        let (status, reason) = match &result.status {
            JobStatus::Success => (LedgerStatus::Success, None),
            JobStatus::Failed(reason) => (LedgerStatus::Failed, Some(reason.clone())),
        };
        LedgerEntry {
            job_id: result.job_id.clone(),
            source_url: result.source_url.clone(),
            status,
            reason,
            attempts: result.attempts,
            counters: result.content.counters,
            recorded_at: Utc::now(),
        }
    }
}

/// What a run produced; written to `runs/<run_id>.json` and `latest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub counters: JobCounters,
    pub output_dir: String,
}
