//! Job sources: where the WARC files to extract come from.
//!
//! | Source | Module | Input |
//! |--------|--------|-------|
//! | CommonCrawl CC-NEWS | [`cc_news`] | Monthly `warc.paths.gz` indexes filtered by crawl date |
//! | Manifest file | [`manifest`] | One WARC URL or local path per line |
//!
//! Every source returns jobs in discovery order with duplicates removed.

use crate::error::SourceError;
use crate::models::ExtractionJob;
use async_trait::async_trait;
use itertools::Itertools;

pub mod cc_news;
pub mod manifest;

pub use cc_news::CcNewsSource;
pub use manifest::ManifestSource;

/// Enumerates the jobs for a run.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn jobs(&self) -> Result<Vec<ExtractionJob>, SourceError>;
}

/// Turn URLs into jobs, keeping the first occurrence of each job id.
pub(crate) fn jobs_from_urls(urls: impl IntoIterator<Item = String>) -> Vec<ExtractionJob> {
    urls.into_iter()
        .map(ExtractionJob::new)
        .unique_by(|job| job.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_from_urls_dedupes_by_id() {
        let jobs = jobs_from_urls(vec![
            "https://a/CC-NEWS-20220401000546-00192.warc.gz".to_string(),
            "https://b/CC-NEWS-20220401000546-00192.warc.gz".to_string(),
            "https://a/CC-NEWS-20220401010000-00193.warc.gz".to_string(),
        ]);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].source_url, "https://a/CC-NEWS-20220401000546-00192.warc.gz");
        assert_eq!(jobs[1].id.as_str(), "CC-NEWS-20220401010000-00193");
    }
}
