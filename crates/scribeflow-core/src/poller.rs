//! Status Poller
//!
//! Per-job polling loop. Fetches a job's status until it settles in a
//! terminal state, adapting the interval to job state and batch load, and
//! proposing every result to the reconciliation layer (never writing the
//! cache directly). Polls are cancelled explicitly when the job stops
//! being observed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::TranscriptionBackend;
use crate::jobs::{normalize, Job, JobStatus};
use crate::store::JobStore;
use crate::{EngineError, JobId};

/// Default polling period for a lone processing job
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(2000);

/// Stage fragments that read as a queued/loading condition. A pending job
/// in one of these keeps polling at the base period, which covers a
/// server restart mid-job.
const QUEUED_STAGE_HINTS: [&str; 3] = ["queue", "load", "start"];

// =============================================================================
// Interval Policy
// =============================================================================

/// Widened polling period for members of an active batch, capping the
/// aggregate request rate during large splits. At the default base period
/// this yields 5000 ms for more than 3 active members, 3000 ms for more
/// than 1, and 2000 ms otherwise.
pub fn batch_poll_period(base: Duration, active_members: usize) -> Duration {
    if active_members > 3 {
        base * 5 / 2
    } else if active_members > 1 {
        base * 3 / 2
    } else {
        base
    }
}

fn is_queued_stage(stage: &str) -> bool {
    let lowered = stage.to_ascii_lowercase();
    QUEUED_STAGE_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Whether the loop should keep polling at full cadence.
fn should_continue(job: &Job) -> bool {
    match job.status {
        JobStatus::Processing => true,
        JobStatus::Pending => job.stage.as_deref().map(is_queued_stage).unwrap_or(false),
        _ => false,
    }
}

// =============================================================================
// Poll Handle
// =============================================================================

/// Handle to a running poll loop.
///
/// Dropping the handle cancels the loop, so an unobserved job never keeps
/// polling in the background.
#[derive(Debug)]
pub struct PollHandle {
    /// Job being polled
    pub job_id: JobId,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl PollHandle {
    /// Cancels the poll loop. Returns false if it had already stopped.
    pub fn cancel(mut self) -> bool {
        match self.cancel_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

// =============================================================================
// Status Poller
// =============================================================================

/// Callback resolving how many live members share the job's active batch,
/// if it belongs to one.
pub type BatchLoadFn = Arc<dyn Fn(JobId) -> Option<usize> + Send + Sync>;

/// Spawns and owns per-job polling loops.
pub struct StatusPoller {
    backend: Arc<dyn TranscriptionBackend>,
    store: Arc<JobStore>,
    base_period: Duration,
    batch_load: BatchLoadFn,
}

impl StatusPoller {
    pub fn new(
        backend: Arc<dyn TranscriptionBackend>,
        store: Arc<JobStore>,
        base_period: Duration,
        batch_load: BatchLoadFn,
    ) -> Self {
        Self {
            backend,
            store,
            base_period,
            batch_load,
        }
    }

    /// Starts a poll loop for `job_id`. The first fetch happens
    /// immediately; the loop then re-polls at the effective period until
    /// the status settles, confirming the terminal value with exactly one
    /// extra poll.
    pub fn spawn(&self, job_id: JobId) -> PollHandle {
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let batch_load = Arc::clone(&self.batch_load);
        let base_period = self.base_period;
        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            debug!("Poll loop started for job {}", job_id);
            let mut confirmed = false;

            loop {
                let generation = store.generation(job_id);
                let stamped_at = Utc::now();

                match backend.fetch_status(job_id).await {
                    Ok(raw) => {
                        store.apply_poll(stamped_at, generation, normalize(raw));
                    }
                    Err(EngineError::JobNotFound(_)) => {
                        warn!("Job {} no longer exists, stopping poll", job_id);
                        break;
                    }
                    Err(e) => {
                        // Last-known value is retained; retried next tick
                        debug!("Poll for job {} failed: {}", job_id, e);
                    }
                }

                match store.job(job_id) {
                    Some(job) if should_continue(&job) => confirmed = false,
                    _ if !confirmed => confirmed = true,
                    _ => {
                        info!("Job {} settled, stopping poll", job_id);
                        break;
                    }
                }

                let period = (batch_load)(job_id)
                    .map(|active| batch_poll_period(base_period, active))
                    .unwrap_or(base_period);

                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Poll loop for job {} cancelled", job_id);
                        break;
                    }
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });

        PollHandle {
            job_id,
            cancel_tx: Some(cancel_tx),
        }
    }
}
