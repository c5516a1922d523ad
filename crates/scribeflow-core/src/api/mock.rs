//! Mock Backend
//!
//! Scripted in-memory implementation of [`TranscriptionBackend`] used by
//! unit and flow tests. Statuses are queued per job; once a job's script is
//! exhausted, the last record is repeated, which mirrors a backend whose
//! state has settled.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{JobAction, SplitBatchResponse, TranscriptionBackend};
use crate::jobs::RawJobRecord;
use crate::settings::TranscribeSettings;
use crate::{EngineError, EngineResult, JobId};

#[derive(Default)]
struct MockState {
    scripts: HashMap<JobId, VecDeque<RawJobRecord>>,
    last: HashMap<JobId, RawJobRecord>,
    actions: Vec<(JobId, JobAction)>,
    split: Option<SplitBatchResponse>,
    fail_next_action: Option<EngineError>,
    fail_polls: bool,
}

/// Scripted backend for tests
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    fetch_count: AtomicUsize,
}

impl MockBackend {
    /// Creates an empty mock backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a status record to be returned for `job_id`, in push order.
    pub fn push_status(&self, job_id: JobId, record: RawJobRecord) {
        let mut state = self.state.lock().unwrap();
        state.scripts.entry(job_id).or_default().push_back(record);
    }

    /// Sets the split-batch response returned by [`Self::split_batch`].
    pub fn set_split_response(&self, resp: SplitBatchResponse) {
        self.state.lock().unwrap().split = Some(resp);
    }

    /// Makes the next `submit_action` call fail with the given error.
    pub fn fail_next_action(&self, error: EngineError) {
        self.state.lock().unwrap().fail_next_action = Some(error);
    }

    /// Makes every poll fail until re-enabled.
    pub fn set_fail_polls(&self, fail: bool) {
        self.state.lock().unwrap().fail_polls = fail;
    }

    /// Number of `fetch_status` calls seen so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Actions submitted so far, in order.
    pub fn submitted_actions(&self) -> Vec<(JobId, JobAction)> {
        self.state.lock().unwrap().actions.clone()
    }
}

#[async_trait]
impl TranscriptionBackend for MockBackend {
    async fn fetch_status(&self, job_id: JobId) -> EngineResult<RawJobRecord> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if state.fail_polls {
            return Err(EngineError::Transient("mock poll failure".to_string()));
        }

        if let Some(record) = state.scripts.get_mut(&job_id).and_then(|q| q.pop_front()) {
            state.last.insert(job_id, record.clone());
            return Ok(record);
        }
        state
            .last
            .get(&job_id)
            .cloned()
            .ok_or(EngineError::JobNotFound(job_id))
    }

    async fn submit_action(
        &self,
        job_id: JobId,
        action: JobAction,
        _settings: Option<&TranscribeSettings>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.fail_next_action.take() {
            return Err(error);
        }
        state.actions.push((job_id, action));
        Ok(())
    }

    async fn split_batch(&self, job_id: JobId) -> EngineResult<SplitBatchResponse> {
        self.state
            .lock()
            .unwrap()
            .split
            .clone()
            .ok_or(EngineError::JobNotFound(job_id))
    }
}
