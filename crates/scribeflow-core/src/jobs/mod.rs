//! Job Model Module
//!
//! Canonical client-side representation of one transcription attempt,
//! plus the status state machine the rest of the engine reasons about.

mod normalize;

pub use normalize::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{FileId, JobId, Progress};

// =============================================================================
// Job Status
// =============================================================================

/// Canonical job status.
///
/// Raw wire values are folded into these four states at the boundary
/// (see [`normalize`]); unknown strings never propagate past it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Not yet started, or reset to initial state
    #[default]
    Pending,
    /// Transcription pipeline is running
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    /// Parses a raw status string, case-insensitively.
    ///
    /// Anything outside the four-member enum maps to `Pending`.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => {
                warn!("Unknown job status '{}', treating as pending", other);
                JobStatus::Pending
            }
        }
    }

    /// Returns true once the job can no longer make progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Returns true while the job still counts toward batch liveness.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    /// Transition table for the status state machine.
    ///
    /// Terminal states only leave via a reset to `Pending` (restart/clear);
    /// everything may re-enter `Pending`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (_, Pending) => true,
            (Pending, Processing) => true,
            (Processing, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            (Completed, Completed) | (Failed, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// One tracked transcription attempt for a file or file-chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Backend-assigned identifier
    pub id: JobId,
    /// Source file a split chunk was derived from; `None` for non-split jobs
    pub parent_id: Option<FileId>,
    /// Canonical status
    pub status: JobStatus,
    /// Fraction in `[0, 1]`
    pub progress: Progress,
    /// Free-text description of the current processing step
    pub stage: Option<String>,
    /// Error text; legacy stage encoding is decoded away by the normalizer
    pub error_message: Option<String>,
    /// When processing started
    pub started_at: Option<DateTime<Utc>>,
    /// When processing finished
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque settings blob (model, language, diarization); passthrough only
    pub metadata: Option<String>,
}

impl Job {
    /// Creates an idle job record, as seen before any backend contact.
    pub fn idle(id: JobId) -> Self {
        Self {
            id,
            parent_id: None,
            status: JobStatus::Pending,
            progress: 0.0,
            stage: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            metadata: None,
        }
    }

    /// Checks if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
