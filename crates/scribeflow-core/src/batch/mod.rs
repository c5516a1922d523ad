//! Batch Model
//!
//! A batch is a client-inferred grouping of sibling jobs produced by
//! splitting one source file. The backend only provides a parent
//! reference, so membership is either detected heuristically
//! ([`detect_batch`]) or seeded authoritatively from a split response.

mod aggregate;
mod detect;

pub use aggregate::*;
pub use detect::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::SplitBatchResponse;
use crate::{FileId, JobId};

/// One member of a batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChunk {
    pub job_id: JobId,
    pub original_filename: String,
}

/// A group of sibling jobs derived from one source file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// The source file all chunks were split from
    pub parent_id: FileId,
    /// Members in display order
    pub chunks: Vec<BatchChunk>,
    pub started_at: DateTime<Utc>,
    /// Set once; never cleared or overwritten
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Creates a batch from detected or seeded members.
    pub fn new(parent_id: FileId, chunks: Vec<BatchChunk>) -> Self {
        Self {
            parent_id,
            chunks,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Seeds a batch from a split response, ordered by `order_index`.
    ///
    /// This is authoritative member data and bypasses detection.
    pub fn from_split(resp: &SplitBatchResponse) -> Self {
        let mut files: Vec<_> = resp.created_files.iter().collect();
        files.sort_by_key(|f| f.order_index);

        let chunks = files
            .into_iter()
            .map(|f| BatchChunk {
                job_id: f.file_id,
                original_filename: f.original_filename.clone(),
            })
            .collect();

        debug!(
            "Seeded batch for parent {} with {} chunks",
            resp.parent_file_id,
            resp.created_files.len()
        );
        Self::new(resp.parent_file_id, chunks)
    }

    /// Marks completion exactly once; later calls are no-ops.
    pub fn mark_completed(&mut self, at: DateTime<Utc>) {
        if self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
    }

    pub fn is_member(&self, job_id: JobId) -> bool {
        self.chunks.iter().any(|c| c.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
