//! Everything the extractor writes to its output directory.
//!
//! # Submodules
//!
//! - [`jsonl`]: partitioned article files and the job ledger
//! - [`summary`]: per-run summaries and `latest.json`
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! ├── articles/
//! │   └── date_crawled=2022-04-01/
//! │       └── language=eng/
//! │           └── CC-NEWS-20220401000546-00192.jsonl
//! ├── jobs.jsonl
//! ├── runs/
//! │   └── 20221017T101500123Z.json
//! └── latest.json
//! ```

pub mod jsonl;
pub mod summary;

pub use jsonl::JsonlStore;
pub use summary::publish_summary;
