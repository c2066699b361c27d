//! Gap repository: persistence, deduplication, decay and the detection schedule

pub mod fingerprint;
pub mod repository;
pub mod schedule;

pub use fingerprint::{dedup_batch, fingerprint, normalize_text, similarity};
pub use repository::{GapRepository, SaveOutcome};
pub use schedule::{DetectionSchedule, PeriodicOutcome};
