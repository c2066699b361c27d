//! Capsmith - capability gap detection and lifecycle management
//!
//! Capsmith watches the observations an agent harness records, detects
//! recurring capability gaps with declarative YAML rules, synthesizes
//! proposals for them and installs, tracks and rolls back the resulting
//! capabilities under a confined instance root.
//!
//! # Example
//!
//! ```ignore
//! use capsmith::db::Database;
//! use capsmith::detection::{run_detection, RuleSet};
//! use capsmith::observations::ObservationLog;
//!
//! fn main() -> anyhow::Result<()> {
//!     let db = Database::open("capsmith.db", std::time::Duration::from_secs(5))?;
//!     let rules = RuleSet::load_dir("rules".as_ref())?;
//!     let observations = ObservationLog::new("observations.jsonl").read_unprocessed(usize::MAX)?;
//!     let report = run_detection(&db, &rules, &observations, 100)?;
//!     println!("{} new gaps", report.new_gap_ids.len());
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod types;
pub mod db;
pub mod config;
pub mod observations;

// Feature modules
pub mod detection;
pub mod gaps;
pub mod proposals;
pub mod synthesis;
pub mod lifecycle;
pub mod dependencies;
pub mod usage;
pub mod cli;

// Re-export commonly used types for convenience
pub use db::Database;
pub use error::{EvolveError, FailureKind, Result};
pub use types::{Capability, Gap, Proposal};
