//! Stuck-Job Detection
//!
//! A processing job whose progress and stage stop advancing within the
//! stall window is flagged as stuck. The flag is a derived recovery
//! affordance, not an error: it is surfaced to the user (force-restart)
//! and never auto-resolved by the engine.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::jobs::{Job, JobStatus};

/// Default window a processing job may go without visible progress
pub const DEFAULT_STALL_WINDOW: Duration = Duration::from_secs(120);

/// Tracks the last observed advance of a single job.
#[derive(Clone, Debug)]
pub struct StallTracker {
    last_progress: f64,
    last_stage: Option<String>,
    last_advance: DateTime<Utc>,
}

impl StallTracker {
    /// Starts tracking from the given observation time.
    pub fn new(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            last_progress: job.progress,
            last_stage: job.stage.clone(),
            last_advance: now,
        }
    }

    /// Records an observation. Returns true when the job advanced
    /// (progress or stage changed) since the previous one.
    pub fn observe(&mut self, job: &Job, now: DateTime<Utc>) -> bool {
        let advanced = (job.progress - self.last_progress).abs() > f64::EPSILON
            || job.stage != self.last_stage;

        if advanced {
            self.last_progress = job.progress;
            self.last_stage = job.stage.clone();
            self.last_advance = now;
        }
        advanced
    }

    /// Derives the stuck flag: processing, and no advance within `window`.
    pub fn is_stuck(&self, job: &Job, now: DateTime<Utc>, window: Duration) -> bool {
        if job.status != JobStatus::Processing {
            return false;
        }
        let elapsed = now.signed_duration_since(self.last_advance);
        elapsed.num_milliseconds() > window.as_millis() as i64
    }
}
