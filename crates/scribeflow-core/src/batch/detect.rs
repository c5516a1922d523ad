//! Batch Detector
//!
//! Heuristic grouping of live sibling jobs into a batch when no split
//! response is available (page reload, second client). Pure function over
//! a candidate list so it is unit-testable without network or timers.
//!
//! Known limitation, kept deliberately: "largest sibling group wins" can
//! merge two unrelated concurrent split operations that collide on a
//! parent id. Fixing that needs a server-assigned batch id.

use std::collections::HashMap;

use crate::jobs::JobStatus;
use crate::{FileId, JobId};

use super::{Batch, BatchChunk};

/// Minimum sibling-group size that reads as a genuine split operation.
/// A lone chunk is indistinguishable from a normal single-file job.
const MIN_BATCH_SIZE: usize = 2;

/// One job as seen by the detector
#[derive(Clone, Debug)]
pub struct BatchCandidate {
    pub job_id: JobId,
    pub parent_id: Option<FileId>,
    pub status: JobStatus,
    pub filename: String,
}

/// Groups live sibling jobs into a batch.
///
/// Only jobs with a parent reference and a live status count toward
/// detection; terminal jobs can still be members of an already-detected
/// batch, they just never trigger one. The largest sibling group wins;
/// groups smaller than two members yield `None`.
pub fn detect_batch(candidates: &[BatchCandidate]) -> Option<Batch> {
    let mut groups: HashMap<FileId, Vec<&BatchCandidate>> = HashMap::new();

    for candidate in candidates {
        if !candidate.status.is_active() {
            continue;
        }
        if let Some(parent_id) = candidate.parent_id {
            groups.entry(parent_id).or_default().push(candidate);
        }
    }

    // Largest group wins; ties broken by parent id for determinism
    let (parent_id, members) = groups
        .into_iter()
        .max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.0.cmp(&a.0)))?;

    if members.len() < MIN_BATCH_SIZE {
        return None;
    }

    let chunks = members
        .into_iter()
        .map(|c| BatchChunk {
            job_id: c.job_id,
            original_filename: c.filename.clone(),
        })
        .collect();

    Some(Batch::new(parent_id, chunks))
}
