//! Partitioned JSON-lines article store with a job ledger.
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! ├── articles/
//! │   └── date_crawled=2022-04-01/
//! │       ├── language=eng/
//! │       │   └── CC-NEWS-20220401000546-00192.jsonl
//! │       └── language=deu/
//! │           └── CC-NEWS-20220401000546-00192.jsonl
//! └── jobs.jsonl
//! ```
//!
//! Each job writes one file per partition, named after the job id, so
//! writing a job again replaces its files. Files an earlier write left in
//! partitions the new articles no longer reach are removed. Files are
//! written under a temporary name and renamed into place once complete.
//!
//! The ledger gets one line per terminal job status. It is read back on
//! open; the last line for a job wins.

use crate::error::StoreError;
use crate::models::{Article, ExtractionResult, JobId, LedgerEntry, LedgerStatus};
use crate::sink::ResultStore;
use crate::utils::sanitize_partition_value;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

pub const ARTICLES_DIR: &str = "articles";
pub const LEDGER_FILE: &str = "jobs.jsonl";

pub struct JsonlStore {
    root: PathBuf,
    partitions: Vec<String>,
    batch_size: usize,
    ledger: BufWriter<fs::File>,
    ledger_path: PathBuf,
    statuses: HashMap<JobId, LedgerStatus>,
}

impl JsonlStore {
    /// Open (or create) a store under `root`.
    ///
    /// Fails on partition keys that aren't article fields.
    #[instrument(level = "info", skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(
        root: impl AsRef<Path>,
        partitions: &[String],
        batch_size: usize,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if let Some(unknown) = partitions.iter().find(|p| !Article::is_field(p)) {
            return Err(StoreError::UnknownPartition(unknown.clone()));
        }

        let articles = root.join(ARTICLES_DIR);
        fs::create_dir_all(&articles)
            .await
            .map_err(|e| StoreError::io(&articles, e))?;

        let ledger_path = root.join(LEDGER_FILE);
        let (statuses, torn) = load_ledger(&ledger_path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ledger_path)
            .await
            .map_err(|e| StoreError::io(&ledger_path, e))?;
        let mut ledger = BufWriter::new(file);
        if torn {
            // terminate the torn line so the next entry starts fresh
            ledger
                .write_all(b"\n")
                .await
                .map_err(|e| StoreError::io(&ledger_path, e))?;
        }

        info!(
            known_jobs = statuses.len(),
            partitions = ?partitions,
            "Opened article store"
        );
        Ok(JsonlStore {
            root,
            partitions: partitions.to_vec(),
            batch_size: batch_size.max(1),
            ledger,
            ledger_path,
            statuses,
        })
    }

    /// Directory an article belongs in.
    pub fn partition_dir(&self, article: &Article) -> PathBuf {
        let mut dir = self.root.join(ARTICLES_DIR);
        for key in &self.partitions {
            let value = article.field(key).flatten();
            dir.push(format!("{key}={}", sanitize_partition_value(value)));
        }
        dir
    }

    /// Write a job's articles, one file per partition. Returns the files
    /// written.
    async fn write_articles(
        &self,
        job_id: &JobId,
        articles: &[Article],
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut by_partition: BTreeMap<PathBuf, Vec<&Article>> = BTreeMap::new();
        for article in articles {
            by_partition
                .entry(self.partition_dir(article))
                .or_default()
                .push(article);
        }

        let mut written = Vec::with_capacity(by_partition.len());
        for (dir, articles) in by_partition {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
            let path = dir.join(format!("{job_id}.jsonl"));
            let tmp = dir.join(format!(".{job_id}.jsonl.tmp"));
            if let Err(e) = self.write_lines(&tmp, &articles).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
            fs::rename(&tmp, &path)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            debug!(path = %path.display(), count = articles.len(), "Wrote partition file");
            written.push(path);
        }
        Ok(written)
    }

    /// Remove files of `job_id` outside `keep` left by an earlier write.
    async fn remove_stale(&self, job_id: &JobId, keep: &[PathBuf]) -> Result<usize, StoreError> {
        let name = format!("{job_id}.jsonl");
        let mut removed = 0;
        let mut dirs = vec![self.root.join(ARTICLES_DIR)];
        while let Some(dir) = dirs.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| StoreError::io(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&dir, e))?
            {
                let path = entry.path();
                let kind = entry.file_type().await.map_err(|e| StoreError::io(&path, e))?;
                if kind.is_dir() {
                    dirs.push(path);
                } else if entry.file_name().as_os_str() == OsStr::new(&name) && !keep.contains(&path) {
                    fs::remove_file(&path)
                        .await
                        .map_err(|e| StoreError::io(&path, e))?;
                    debug!(path = %path.display(), "Removed stale partition file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn write_lines(&self, path: &Path, articles: &[&Article]) -> Result<(), StoreError> {
        let file = fs::File::create(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let mut out = BufWriter::new(file);
        for (i, article) in articles.iter().enumerate() {
            let mut line = serde_json::to_vec(article)?;
            line.push(b'\n');
            out.write_all(&line).await.map_err(|e| StoreError::io(path, e))?;
            if (i + 1) % self.batch_size == 0 {
                out.flush().await.map_err(|e| StoreError::io(path, e))?;
            }
        }
        out.flush().await.map_err(|e| StoreError::io(path, e))?;
        out.get_ref()
            .sync_all()
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.ledger
            .write_all(&line)
            .await
            .map_err(|e| StoreError::io(&self.ledger_path, e))?;
        self.ledger
            .flush()
            .await
            .map_err(|e| StoreError::io(&self.ledger_path, e))
    }
}

/// Read the ledger; the last status recorded for a job wins.
///
/// Also reports whether the file ends mid-line.
async fn load_ledger(path: &Path) -> Result<(HashMap<JobId, LedgerStatus>, bool), StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((HashMap::new(), false)),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let torn = !text.is_empty() && !text.ends_with('\n');

    let mut statuses = HashMap::new();
    for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                statuses.insert(entry.job_id, entry.status);
            }
            // a torn final line after a crash is expected
            Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable ledger line"),
        }
    }
    Ok((statuses, torn))
}

#[async_trait]
impl ResultStore for JsonlStore {
    fn completed_jobs(&self) -> HashSet<JobId> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == LedgerStatus::Success)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[instrument(level = "info", skip_all, fields(job = %result.job_id))]
    async fn upsert(&mut self, result: &ExtractionResult) -> Result<(), StoreError> {
        let articles = &result.content.articles;
        if result.status.is_success() {
            let mut files = Vec::new();
            if articles.is_empty() {
                info!("Ignored since empty");
            } else {
                files = self.write_articles(&result.job_id, articles).await?;
                info!(articles = articles.len(), files = files.len(), "Wrote articles");
            }
            // only a job seen before can have files elsewhere
            if self.statuses.contains_key(&result.job_id) {
                let removed = self.remove_stale(&result.job_id, &files).await?;
                if removed > 0 {
                    info!(removed, "Removed files from an earlier write");
                }
            }
        }

        let entry = LedgerEntry::from(result);
        self.append_ledger(&entry).await?;
        self.statuses.insert(entry.job_id, entry.status);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        self.ledger
            .flush()
            .await
            .map_err(|e| StoreError::io(&self.ledger_path, e))?;
        self.ledger
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| StoreError::io(&self.ledger_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractedContent, ExtractionJob, JobCounters};

    fn article(url: &str, language: &str, date_publish: Option<&str>) -> Article {
        Article {
            title: "Title".into(),
            main_text: "Some body text for the article.".into(),
            url: url.into(),
            source_domain: "https://example.com".into(),
            date_publish: date_publish.map(str::to_string),
            date_crawled: "2022-04-01".into(),
            language: language.into(),
        }
    }

    fn result(url: &str, articles: Vec<Article>) -> ExtractionResult {
        let counters = JobCounters {
            extracted: articles.len() as u64,
            ..JobCounters::default()
        };
        ExtractionResult::success(&ExtractionJob::new(url), ExtractedContent { articles, counters })
    }

    fn defaults() -> Vec<String> {
        vec!["date_crawled".to_string(), "language".to_string()]
    }

    fn read_lines(path: &Path) -> Vec<Article> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_rejects_unknown_partition() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonlStore::open(dir.path(), &["colour".to_string()], 10).await.err().unwrap();
        assert!(matches!(err, StoreError::UnknownPartition(ref k) if k == "colour"));
    }

    #[tokio::test]
    async fn test_writes_hive_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path(), &defaults(), 1).await.unwrap();

        let res = result(
            "/data/job-1.warc.gz",
            vec![
                article("https://example.com/a", "eng", None),
                article("https://example.com/b", "eng", None),
                article("https://example.com/c", "deu", None),
            ],
        );
        store.upsert(&res).await.unwrap();
        store.flush().await.unwrap();

        let base = dir.path().join("articles/date_crawled=2022-04-01");
        let eng = read_lines(&base.join("language=eng/job-1.jsonl"));
        let deu = read_lines(&base.join("language=deu/job-1.jsonl"));
        assert_eq!(eng.len(), 2);
        assert_eq!(deu.len(), 1);
        assert_eq!(deu[0].url, "https://example.com/c");
        assert!(!base.join("language=eng/.job-1.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_partition_value_uses_default_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path(), &["date_publish".to_string()], 10).await.unwrap();
        let path = store.partition_dir(&article("https://example.com/a", "eng", None));
        assert!(path.ends_with("articles/date_publish=__HIVE_DEFAULT_PARTITION__"));
        let path = store.partition_dir(&article("https://example.com/a", "eng", Some("2022-03-30")));
        assert!(path.ends_with("articles/date_publish=2022-03-30"));
    }

    #[tokio::test]
    async fn test_empty_job_writes_no_article_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path(), &defaults(), 10).await.unwrap();
        store.upsert(&result("/data/empty.warc", vec![])).await.unwrap();
        store.flush().await.unwrap();

        let mut entries = std::fs::read_dir(dir.path().join(ARTICLES_DIR)).unwrap();
        assert!(entries.next().is_none());
        assert!(store.completed_jobs().contains(&JobId::from("empty")));
    }

    #[tokio::test]
    async fn test_rewriting_a_job_replaces_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path(), &defaults(), 10).await.unwrap();
        let two = vec![
            article("https://example.com/a", "eng", None),
            article("https://example.com/b", "eng", None),
        ];
        store.upsert(&result("/data/job.warc", two)).await.unwrap();
        let one = vec![article("https://example.com/z", "eng", None)];
        store.upsert(&result("/data/job.warc", one)).await.unwrap();

        let lines = read_lines(
            &dir.path().join("articles/date_crawled=2022-04-01/language=eng/job.jsonl"),
        );
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].url, "https://example.com/z");
    }

    #[tokio::test]
    async fn test_rewriting_a_job_drops_partitions_it_left() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path(), &defaults(), 10).await.unwrap();
        let base = dir.path().join("articles/date_crawled=2022-04-01");

        let mixed = vec![
            article("https://example.com/a", "eng", None),
            article("https://example.com/b", "deu", None),
        ];
        store.upsert(&result("/data/job.warc", mixed.clone())).await.unwrap();
        store.upsert(&result("/data/other.warc", mixed)).await.unwrap();
        assert!(base.join("language=deu/job.jsonl").exists());

        let english = vec![article("https://example.com/c", "eng", None)];
        store.upsert(&result("/data/job.warc", english)).await.unwrap();
        assert!(!base.join("language=deu/job.jsonl").exists());
        assert_eq!(read_lines(&base.join("language=eng/job.jsonl")).len(), 1);
        assert!(base.join("language=deu/other.jsonl").exists());

        store.upsert(&result("/data/job.warc", vec![])).await.unwrap();
        assert!(!base.join("language=eng/job.jsonl").exists());
        assert!(base.join("language=eng/other.jsonl").exists());
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen_and_last_status_wins() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = JsonlStore::open(dir.path(), &defaults(), 10).await.unwrap();
            let failed = ExtractionResult::failed(&ExtractionJob::new("/data/a.warc"), "HTTP 503");
            store.upsert(&failed).await.unwrap();
            store.upsert(&result("/data/b.warc", vec![])).await.unwrap();
            store.upsert(&result("/data/c.warc", vec![])).await.unwrap();
            let failed_c = ExtractionResult::failed(&ExtractionJob::new("/data/c.warc"), "cancelled");
            store.upsert(&failed_c).await.unwrap();
            store.flush().await.unwrap();
        }
        // a torn line from an interrupted write
        let ledger = dir.path().join(LEDGER_FILE);
        let mut text = std::fs::read_to_string(&ledger).unwrap();
        text.push_str("{\"job_id\":\"d\",\"sta");
        std::fs::write(&ledger, text).unwrap();

        let mut store = JsonlStore::open(dir.path(), &defaults(), 10).await.unwrap();
        let completed = store.completed_jobs();
        assert_eq!(completed, HashSet::from([JobId::from("b")]));

        // entries appended after the torn line stay readable
        store.upsert(&result("/data/e.warc", vec![])).await.unwrap();
        store.flush().await.unwrap();
        drop(store);
        let store = JsonlStore::open(dir.path(), &defaults(), 10).await.unwrap();
        assert!(store.completed_jobs().contains(&JobId::from("e")));
    }
}
