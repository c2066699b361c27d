//! Detection-interval gate and the periodic detection pass

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::repository::GapRepository;
use crate::db::Database;
use crate::detection::DetectionReport;
use crate::error::{EvolveError, Result};
use crate::types::{format_timestamp, parse_timestamp};

/// Set only after a detection pass succeeds
pub const LAST_SUCCESS_KEY: &str = "last_detection_time";
/// Set at the start of every attempt, successful or not
pub const LAST_ATTEMPT_KEY: &str = "last_detection_attempt";

/// Outcome of one `run_periodic` call
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeriodicOutcome {
    pub ran: bool,
    pub reason: Option<String>,
    pub decayed: usize,
    pub report: Option<DetectionReport>,
    pub error: Option<String>,
}

pub struct DetectionSchedule<'a> {
    db: &'a Database,
    interval_minutes: i64,
}

impl<'a> DetectionSchedule<'a> {
    /// An interval of zero or less disables periodic detection
    pub fn new(db: &'a Database, interval_minutes: i64) -> Self {
        Self { db, interval_minutes }
    }

    pub fn last_success(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_metadata(LAST_SUCCESS_KEY)?.map(|v| parse_timestamp(&v)))
    }

    pub fn last_attempt(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.db.get_metadata(LAST_ATTEMPT_KEY)?.map(|v| parse_timestamp(&v)))
    }

    /// True when the interval has elapsed since the last successful pass
    pub fn should_run(&self, now: DateTime<Utc>) -> Result<bool> {
        if self.interval_minutes <= 0 {
            return Ok(false);
        }
        Ok(match self.last_success()? {
            Some(last) => now - last >= Duration::minutes(self.interval_minutes),
            None => true,
        })
    }

    pub fn record_attempt(&self, now: DateTime<Utc>) -> Result<()> {
        self.db.set_metadata(LAST_ATTEMPT_KEY, &format_timestamp(&now))
    }

    pub fn record_success(&self, now: DateTime<Utc>) -> Result<()> {
        self.db.set_metadata(LAST_SUCCESS_KEY, &format_timestamp(&now))
    }

    /// Gate, mark the attempt, decay stale gaps, then run `detect`.
    /// The success marker is written only when `detect` succeeds, so a
    /// failing pass is retried on the next call. A lock timeout from `detect`
    /// is returned as `Err` instead of being folded into the outcome.
    pub fn run_periodic<F>(&self, now: DateTime<Utc>, force: bool, detect: F) -> Result<PeriodicOutcome>
    where
        F: FnOnce() -> anyhow::Result<DetectionReport>,
    {
        if !force && !self.should_run(now)? {
            return Ok(PeriodicOutcome {
                reason: Some("Not enough time elapsed since last detection".to_string()),
                ..Default::default()
            });
        }

        self.record_attempt(now)?;
        let decayed = GapRepository::new(self.db).decay(now)?;

        match detect() {
            Ok(report) => {
                self.record_success(now)?;
                info!(
                    "Periodic detection: {} new gaps, {} merged, {} decayed",
                    report.new_gap_ids.len(),
                    report.merged,
                    decayed
                );
                Ok(PeriodicOutcome {
                    ran: true,
                    decayed,
                    report: Some(report),
                    ..Default::default()
                })
            }
            Err(e) => {
                let message = match e.downcast::<EvolveError>() {
                    // a busy store is the caller's problem, not a failed pass
                    Ok(err) if err.is_lock_timeout() => return Err(err),
                    Ok(err) => err.to_string(),
                    Err(e) => format!("{:#}", e),
                };
                warn!("Periodic detection failed: {}", message);
                Ok(PeriodicOutcome {
                    ran: true,
                    decayed,
                    error: Some(message),
                    ..Default::default()
                })
            }
        }
    }
}
