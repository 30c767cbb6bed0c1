//! Jobs listed in a local manifest file.
//!
//! One WARC URL, `file://` URL or path per line. Blank lines and lines
//! starting with `#` are ignored.

use super::{JobSource, jobs_from_urls};
use crate::error::SourceError;
use crate::models::ExtractionJob;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ManifestSource { path: path.into() }
    }
}

pub(crate) fn parse_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl JobSource for ManifestSource {
    fn name(&self) -> &'static str {
        "manifest"
    }

    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    async fn jobs(&self) -> Result<Vec<ExtractionJob>, SourceError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        let jobs = jobs_from_urls(parse_manifest(&text));
        info!(count = jobs.len(), "Loaded jobs from manifest");
        Ok(jobs)
    }
}
