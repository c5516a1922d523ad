//! Batch Progress Aggregator
//!
//! Reduces a batch plus the current states of its member jobs into one
//! display-ready summary: terminal counts, the current representative
//! chunk, and an overall progress figure. Progress intentionally shows
//! the current chunk's fraction rather than chunk-count progress, so the
//! bar doesn't jump at chunk boundaries.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::jobs::{Job, JobStatus};
use crate::{FileId, JobId, Progress};

use super::Batch;

// =============================================================================
// Aggregation
// =============================================================================

/// Display-ready batch summary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub parent_id: FileId,
    pub total: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// The member currently shown as "in progress"
    pub current_job_id: JobId,
    pub current_filename: String,
    pub is_complete: bool,
    /// Current chunk's fraction, or `1.0` once complete
    pub progress: Progress,
}

/// Reduces a batch and its members' job states into a [`BatchProgress`].
///
/// The current member is the active (processing or pending) chunk with
/// the latest `started_at`; members with a start time sort before those
/// without one, and ties keep chunk order. With no active member left,
/// the batch's last chunk stands in. Members the store has not seen yet
/// count as pending.
pub fn aggregate(batch: &Batch, lookup: impl Fn(JobId) -> Option<Job>) -> BatchProgress {
    if batch.chunks.is_empty() {
        return BatchProgress {
            parent_id: batch.parent_id,
            total: 0,
            completed_count: 0,
            failed_count: 0,
            current_job_id: 0,
            current_filename: String::new(),
            is_complete: true,
            progress: 1.0,
        };
    }

    let members: Vec<(usize, Option<Job>)> = batch
        .chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| (idx, lookup(chunk.job_id)))
        .collect();

    let mut completed_count = 0;
    let mut failed_count = 0;
    for (_, job) in &members {
        match job.as_ref().map(|j| j.status) {
            Some(JobStatus::Completed) => completed_count += 1,
            Some(JobStatus::Failed) => failed_count += 1,
            _ => {}
        }
    }

    let mut active: Vec<&(usize, Option<Job>)> = members
        .iter()
        .filter(|(_, job)| {
            job.as_ref()
                .map(|j| j.status.is_active())
                .unwrap_or(true)
        })
        .collect();
    active.sort_by(|a, b| compare_started_desc(&a.1, &b.1));

    let current_index = active
        .first()
        .map(|(idx, _)| *idx)
        .unwrap_or_else(|| batch.chunks.len().saturating_sub(1));
    let current_chunk = &batch.chunks[current_index];

    let is_complete = completed_count + failed_count == batch.chunks.len();
    let progress = if is_complete {
        1.0
    } else {
        members[current_index]
            .1
            .as_ref()
            .map(|j| j.progress)
            .unwrap_or(0.0)
    };

    BatchProgress {
        parent_id: batch.parent_id,
        total: batch.chunks.len(),
        completed_count,
        failed_count,
        current_job_id: current_chunk.job_id,
        current_filename: current_chunk.original_filename.clone(),
        is_complete,
        progress,
    }
}

/// Descending by `started_at`; jobs with a start time sort before jobs
/// (or unseen members) without one. Equal keys keep their relative order
/// because the caller uses a stable sort.
fn compare_started_desc(a: &Option<Job>, b: &Option<Job>) -> Ordering {
    let a_started = a.as_ref().and_then(|j| j.started_at);
    let b_started = b.as_ref().and_then(|j| j.started_at);
    match (a_started, b_started) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// =============================================================================
// Completion Ledger
// =============================================================================

/// One-shot completion registry keyed by parent id, so repeated
/// aggregation passes never re-notify.
#[derive(Debug, Default)]
pub struct CompletionLedger {
    notified: Mutex<HashSet<FileId>>,
}

impl CompletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only the first time completion is recorded for
    /// `parent_id`.
    pub fn first_completion(&self, parent_id: FileId) -> bool {
        self.notified.lock().unwrap().insert(parent_id)
    }

    /// Forgets a parent, allowing a future split of the same file to
    /// notify again.
    pub fn forget(&self, parent_id: FileId) {
        self.notified.lock().unwrap().remove(&parent_id);
    }
}
