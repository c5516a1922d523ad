//! Engine Event Emission
//!
//! Broadcasts state changes to the consumer (UI shell) over an unbounded
//! channel. Events are emitted after the store has been updated, so a
//! consumer reading the store on receipt always sees the new state.

use tokio::sync::mpsc;

use crate::jobs::Job;
use crate::{FileId, JobId};

// =============================================================================
// Event Types
// =============================================================================

/// Derived views that depend on a job's status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Transcript segment list
    Segments,
    /// Speaker list
    Speakers,
}

/// Engine update event
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A job's cached state changed (poll or speculative write)
    JobUpdated { job_id: JobId, job: Job },
    /// A processing job stopped advancing within the stall window
    JobStuck { job_id: JobId },
    /// A derived view was invalidated and should be re-fetched
    ViewInvalidated { job_id: JobId, view: ViewKind },
    /// The file list should be re-fetched
    FileListInvalidated,
    /// Sibling jobs were grouped into a batch
    BatchDetected { parent_id: FileId, size: usize },
    /// The batch member shown as "current" changed (debounced)
    CurrentChunkChanged { parent_id: FileId, job_id: JobId },
    /// All batch members reached a terminal state; fired once per parent
    BatchCompleted {
        parent_id: FileId,
        completed: usize,
        failed: usize,
    },
    /// The completion banner display window elapsed
    BatchBannerCleared { parent_id: FileId },
    /// The batch was dropped after its teardown grace window
    BatchDropped { parent_id: FileId },
}

/// Sender half used by engine internals
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiver half handed to the consumer
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Creates the engine event channel
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
