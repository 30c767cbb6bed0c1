//! Command-line interface definitions for the article extractor.
//!
//! Every option can also come from the YAML config file (`--config`); a flag
//! given on the command line wins over the file.

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the article extractor.
///
/// # Examples
///
/// ```sh
/// # One day of CC-NEWS, articles from two sites
/// article_extractor -o ./out --start-date 2022-04-01 --end-date 2022-04-02 \
///     -p '*bbc.co.uk*' -p '*reuters.com*'
///
/// # A fixed list of WARC files
/// article_extractor -o ./out --manifest warcs.txt -p '*'
///
/// # Everything from a config file
/// article_extractor -c extractor.yaml
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Output directory for articles, the job ledger and run summaries
    #[arg(short, long, env = "EXTRACTOR_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Optional path to a YAML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Glob pattern a record URL must match (repeatable)
    #[arg(short, long = "pattern", value_name = "GLOB")]
    pub patterns: Vec<String>,

    /// First crawl day to extract (inclusive)
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub start_date: Option<NaiveDate>,

    /// Day to stop at (exclusive); defaults to today
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub end_date: Option<NaiveDate>,

    /// Read WARC URLs or paths from this file instead of CC-NEWS
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Number of WARC files processed at once (default: available CPUs)
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Stop each WARC after this many records
    #[arg(long)]
    pub limit: Option<u64>,

    /// Log counters every this many records
    #[arg(long)]
    pub report_every: Option<u64>,

    /// Fetch attempts per WARC, including the first
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Where downloaded WARC files are kept while being parsed
    #[arg(long, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,
}
