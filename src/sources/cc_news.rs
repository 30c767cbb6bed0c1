//! CommonCrawl CC-NEWS index.
//!
//! CC-NEWS publishes one gzipped list of WARC paths per month at
//! `https://data.commoncrawl.org/crawl-data/CC-NEWS/<YYYY>/<MM>/warc.paths.gz`.
//! Each WARC's filename carries the time it was written
//! (`CC-NEWS-20220401000546-00192.warc.gz`), which is what the date window
//! is applied to.
//!
//! A month whose index cannot be downloaded is logged and skipped.

use super::{JobSource, jobs_from_urls};
use crate::error::SourceError;
use crate::models::{ExtractionJob, crawl_date_from_path};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use flate2::read::GzDecoder;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::io::Read;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const CC_DOMAIN: &str = "https://data.commoncrawl.org";
const CC_NEWS_ROUTE: &str = "crawl-data/CC-NEWS";
const WARC_PATHS: &str = "warc.paths.gz";

/// Monthly indexes fetched at once.
const INDEX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct CcNewsSource {
    client: Client,
    domain: String,
    /// Inclusive.
    start: NaiveDateTime,
    /// Exclusive.
    end: NaiveDateTime,
}

impl CcNewsSource {
    pub fn new(client: Client, domain: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        CcNewsSource {
            client,
            domain: domain.into(),
            start: start.and_hms_opt(0, 0, 0).unwrap_or_default(),
            end: end.and_hms_opt(0, 0, 0).unwrap_or_default(),
        }
    }

    /// Whether a WARC path was crawled inside `[start, end)`.
    ///
    /// Paths that don't carry a CC-NEWS timestamp are never in the window.
    pub fn is_within_dates(&self, warc_path: &str) -> bool {
        crawl_date_from_path(warc_path)
            .map(|crawled| crawled >= self.start && crawled < self.end)
            .unwrap_or(false)
    }

    fn index_url(&self, base: &Url, year: i32, month: u32) -> Result<Url, SourceError> {
        let route = format!("{CC_NEWS_ROUTE}/{year}/{month:02}/{WARC_PATHS}");
        base.join(&route).map_err(|source| SourceError::BaseUrl {
            url: self.domain.clone(),
            source,
        })
    }

    /// Download one month's WARC paths. Failures yield an empty list.
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn load_warc_paths(&self, url: Url) -> Vec<String> {
        match self.try_load_warc_paths(&url).await {
            Ok(paths) => {
                debug!(count = paths.len(), "Loaded WARC paths");
                paths
            }
            Err(e) => {
                warn!(error = %e, "Failed to download WARC paths; skipping month");
                Vec::new()
            }
        }
    }

    async fn try_load_warc_paths(&self, url: &Url) -> Result<Vec<String>, SourceError> {
        let request_err = |source: reqwest::Error| SourceError::Request {
            url: url.to_string(),
            source,
        };
        let bytes = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(request_err)?
            .bytes()
            .await
            .map_err(request_err)?;

        let text = decode_index(&bytes).map_err(|source| SourceError::Io {
            path: url.to_string(),
            source,
        })?;
        Ok(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}

/// Gunzip an index body; bodies that aren't gzip are read as-is.
pub(crate) fn decode_index(bytes: &[u8]) -> std::io::Result<String> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text)?;
        Ok(text)
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// `(year, month)` pairs from `start`'s month through `end`'s month.
pub(crate) fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let (mut year, mut month) = (start.year(), start.month());
    while (year, month) <= (end.year(), end.month()) {
        months.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

#[async_trait]
impl JobSource for CcNewsSource {
    fn name(&self) -> &'static str {
        "cc-news"
    }

    #[instrument(level = "info", skip_all, fields(start = %self.start.date(), end = %self.end.date()))]
    async fn jobs(&self) -> Result<Vec<ExtractionJob>, SourceError> {
        let base = Url::parse(&self.domain).map_err(|source| SourceError::BaseUrl {
            url: self.domain.clone(),
            source,
        })?;

        // the end bound is exclusive at midnight, so its own month only
        // matters when the window reaches into it
        let last_day = self.end.date().pred_opt().unwrap_or(self.end.date()).max(self.start.date());
        let mut index_urls = Vec::new();
        for (year, month) in months_between(self.start.date(), last_day) {
            info!(month = %format!("{year}-{month:02}"), "Getting WARC paths");
            index_urls.push(self.index_url(&base, year, month)?);
        }

        let paths: Vec<String> = stream::iter(index_urls)
            .map(|url| self.load_warc_paths(url))
            .buffered(INDEX_CONCURRENCY)
            .flat_map(stream::iter)
            .collect()
            .await;
        let listed = paths.len();

        let mut urls = Vec::new();
        for path in paths.into_iter().filter(|p| self.is_within_dates(p)) {
            match base.join(&path) {
                Ok(url) => urls.push(url.to_string()),
                Err(e) => warn!(%path, error = %e, "Skipping unjoinable WARC path"),
            }
        }

        let jobs = jobs_from_urls(urls);
        info!(listed, selected = jobs.len(), "Found WARC files to process");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn source(start: NaiveDate, end: NaiveDate) -> CcNewsSource {
        CcNewsSource::new(Client::new(), CC_DOMAIN, start, end)
    }

    #[test]
    fn test_months_between_spans_years() {
        assert_eq!(
            months_between(date(2021, 11, 15), date(2022, 2, 1)),
            vec![(2021, 11), (2021, 12), (2022, 1), (2022, 2)]
        );
        assert_eq!(months_between(date(2022, 4, 1), date(2022, 4, 30)), vec![(2022, 4)]);
    }

    #[test]
    fn test_date_window_is_half_open() {
        let s = source(date(2022, 4, 1), date(2022, 4, 2));
        assert!(s.is_within_dates("crawl-data/CC-NEWS/2022/04/CC-NEWS-20220401000000-00001.warc.gz"));
        assert!(s.is_within_dates("crawl-data/CC-NEWS/2022/04/CC-NEWS-20220401235959-00002.warc.gz"));
        assert!(!s.is_within_dates("crawl-data/CC-NEWS/2022/04/CC-NEWS-20220402000000-00003.warc.gz"));
        assert!(!s.is_within_dates("crawl-data/CC-NEWS/2022/03/CC-NEWS-20220331235959-00004.warc.gz"));
        assert!(!s.is_within_dates("crawl-data/CC-NEWS/2022/04/something-else.warc.gz"));
    }

    #[test]
    fn test_index_url() {
        let s = source(date(2022, 4, 1), date(2022, 4, 2));
        let base = Url::parse(CC_DOMAIN).unwrap();
        assert_eq!(
            s.index_url(&base, 2022, 4).unwrap().as_str(),
            "https://data.commoncrawl.org/crawl-data/CC-NEWS/2022/04/warc.paths.gz"
        );
    }

    #[test]
    fn test_decode_index_gzip_and_plain() {
        let listing = "crawl-data/CC-NEWS/2022/04/CC-NEWS-20220401000546-00192.warc.gz\n";
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(listing.as_bytes()).unwrap();
        let gz = enc.finish().unwrap();

        assert_eq!(decode_index(&gz).unwrap(), listing);
        assert_eq!(decode_index(listing.as_bytes()).unwrap(), listing);
        assert!(decode_index(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_index_yields_no_jobs() {
        // nothing listens on the discard port, so every month fails and is skipped
        let s = CcNewsSource::new(Client::new(), "http://127.0.0.1:9", date(2022, 4, 1), date(2022, 4, 2));
        let jobs = s.jobs().await.unwrap();
        assert!(jobs.is_empty());
    }
}
