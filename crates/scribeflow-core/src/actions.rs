//! Optimistic Mutation Controller
//!
//! Makes user-triggered job actions feel immediate: the expected next
//! state is written into the cache before the network call resolves, then
//! either left in place for the next poll to converge, or rolled back to
//! the exact pre-mutation snapshot on failure. Failures propagate to the
//! caller after the rollback, so the UI can report them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::api::{JobAction, TranscriptionBackend};
use crate::jobs::{Job, JobStatus};
use crate::settings::TranscribeSettings;
use crate::store::{DelayScheduler, JobStore, TaskKey};
use crate::{EngineResult, JobId};

/// Outcome of a successfully submitted action
#[derive(Clone, Debug)]
pub struct MutationReceipt {
    /// Client-generated id correlating logs and events for this request
    pub request_id: String,
    pub job_id: JobId,
    pub action: JobAction,
}

/// Applies user actions optimistically against the store.
pub struct MutationController {
    backend: Arc<dyn TranscriptionBackend>,
    store: Arc<JobStore>,
    scheduler: DelayScheduler,
    file_list_settle: Duration,
}

impl MutationController {
    pub fn new(
        backend: Arc<dyn TranscriptionBackend>,
        store: Arc<JobStore>,
        scheduler: DelayScheduler,
        file_list_settle: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            scheduler,
            file_list_settle,
        }
    }

    /// Applies `action` to `job_id`.
    ///
    /// Protocol: snapshot, speculative write, request. On success the
    /// speculative state stays and dependent views are invalidated; the
    /// next poll converges to ground truth. On failure the snapshot is
    /// restored exactly and views are re-invalidated so the real state is
    /// re-fetched.
    pub async fn apply(
        &self,
        action: JobAction,
        job_id: JobId,
        settings: Option<&TranscribeSettings>,
    ) -> EngineResult<MutationReceipt> {
        let request_id = ulid::Ulid::new().to_string();
        info!("Applying {} to job {} (req {})", action, job_id, request_id);

        let snapshot = self.store.snapshot(job_id);
        // Polls already in flight belong to the old generation and get
        // discarded, so they cannot clobber the speculative write.
        self.store.bump_generation(job_id);
        self.store.apply_speculative(self.speculative_state(action, job_id));
        if action == JobAction::Clear {
            // Post-clear these lists are known-empty without a round trip
            self.store.clear_views(job_id);
        }

        match self.backend.submit_action(job_id, action, settings).await {
            Ok(()) => {
                if action != JobAction::Clear {
                    self.store.invalidate_views(job_id);
                }
                let store = Arc::clone(&self.store);
                self.scheduler
                    .schedule(TaskKey::FileListRefresh, self.file_list_settle, move || {
                        store.invalidate_file_list();
                    });

                Ok(MutationReceipt {
                    request_id,
                    job_id,
                    action,
                })
            }
            Err(e) => {
                warn!(
                    "Action {} on job {} failed ({}), rolling back",
                    action, job_id, e
                );
                self.store.restore(job_id, snapshot);
                self.store.invalidate_views(job_id);
                Err(e)
            }
        }
    }

    /// Expected next state for an action, derived from the current entry.
    fn speculative_state(&self, action: JobAction, job_id: JobId) -> Job {
        let current = self
            .store
            .job(job_id)
            .unwrap_or_else(|| Job::idle(job_id));

        match action {
            JobAction::Start | JobAction::Restart => Job {
                status: JobStatus::Processing,
                progress: 0.0,
                stage: None,
                error_message: None,
                started_at: Some(Utc::now()),
                completed_at: None,
                ..current
            },
            JobAction::Resume => Job {
                status: JobStatus::Processing,
                error_message: None,
                completed_at: None,
                started_at: current.started_at.or_else(|| Some(Utc::now())),
                ..current
            },
            JobAction::Cancel | JobAction::Clear => Job {
                status: JobStatus::Pending,
                progress: 0.0,
                stage: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                ..current
            },
        }
    }
}
