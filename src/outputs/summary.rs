//! Run summaries.
//!
//! Every successful run writes its [`RunSummary`] twice: once under
//! `runs/<run_id>.json` for history, and once to `latest.json`, which always
//! sits at the same path.

use crate::error::StoreError;
use crate::models::RunSummary;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, instrument};

pub const RUNS_DIR: &str = "runs";
pub const LATEST_FILE: &str = "latest.json";

/// Write `summary` to the run history and to `latest.json`.
///
/// Returns the path of `latest.json`.
#[instrument(level = "info", skip_all, fields(run_id = %summary.run_id))]
pub async fn publish_summary(output_dir: &Path, summary: &RunSummary) -> Result<PathBuf, StoreError> {
    let json = serde_json::to_vec_pretty(summary)?;

    let runs = output_dir.join(RUNS_DIR);
    fs::create_dir_all(&runs)
        .await
        .map_err(|e| StoreError::io(&runs, e))?;
    let run_path = runs.join(format!("{}.json", summary.run_id));
    write_atomic(&run_path, &json).await?;
    info!(path = %run_path.display(), "Wrote run summary");

    let latest = output_dir.join(LATEST_FILE);
    write_atomic(&latest, &json).await?;
    info!(path = %latest.display(), "Updated latest summary");
    Ok(latest)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}
