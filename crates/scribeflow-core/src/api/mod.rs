//! Backend Job API
//!
//! Interface to the transcription backend's job endpoints. The engine only
//! ever talks to the backend through the [`TranscriptionBackend`] trait, so
//! tests run against [`MockBackend`] and production against [`HttpBackend`].

mod http;
mod mock;

pub use http::*;
pub use mock::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::RawJobRecord;
use crate::settings::TranscribeSettings;
use crate::{EngineResult, FileId, JobId};

// =============================================================================
// Actions
// =============================================================================

/// User-triggered job state transitions.
///
/// `Clear` maps to `DELETE /jobs/{id}`; the rest go through the action
/// endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Start,
    Cancel,
    Restart,
    Resume,
    Clear,
}

impl JobAction {
    /// Wire name for the action endpoint's query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Start => "start",
            JobAction::Cancel => "cancel",
            JobAction::Restart => "restart",
            JobAction::Resume => "resume",
            JobAction::Clear => "clear",
        }
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Split Batch Response
// =============================================================================

/// One chunk file created by a split operation.
#[derive(Clone, Debug, Deserialize)]
pub struct CreatedFile {
    pub file_id: FileId,
    pub original_filename: String,
    pub order_index: u32,
    #[serde(default)]
    pub split_start_seconds: Option<f64>,
    #[serde(default)]
    pub split_end_seconds: Option<f64>,
}

/// Response of `POST /jobs/{id}/split-batch`.
///
/// Seeds a batch directly with authoritative member data, bypassing the
/// sibling-group detection heuristic.
#[derive(Clone, Debug, Deserialize)]
pub struct SplitBatchResponse {
    pub parent_file_id: FileId,
    pub created_files: Vec<CreatedFile>,
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Transcription backend job contract.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// `GET /jobs/{id}/status`
    async fn fetch_status(&self, job_id: JobId) -> EngineResult<RawJobRecord>;

    /// `POST /jobs/{id}/action?action={start|cancel|restart|resume}`, or
    /// `DELETE /jobs/{id}` for [`JobAction::Clear`].
    async fn submit_action(
        &self,
        job_id: JobId,
        action: JobAction,
        settings: Option<&TranscribeSettings>,
    ) -> EngineResult<()>;

    /// `POST /jobs/{id}/split-batch`
    async fn split_batch(&self, job_id: JobId) -> EngineResult<SplitBatchResponse>;
}
