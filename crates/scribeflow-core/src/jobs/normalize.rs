//! Status Normalizer
//!
//! Maps raw, heterogeneously-shaped job records from the wire into the
//! canonical [`Job`] model. Total and pure: malformed input degrades to
//! defaults instead of failing, and normalizing already-canonical data is
//! a no-op.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{Job, JobStatus};
use crate::{FileId, JobId};

/// Legacy encoding of the processing stage inside the error field.
const STAGE_PREFIX: &str = "Stage: ";

// =============================================================================
// Wire Shape
// =============================================================================

/// Raw job record as returned by `GET /jobs/{id}/status`.
///
/// Every field except `id` is optional; unknown fields are dropped by serde.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawJobRecord {
    pub id: JobId,
    #[serde(default)]
    pub parent_id: Option<FileId>,
    #[serde(default)]
    pub status: Option<String>,
    /// May arrive as a 0-100 integer or a 0-1 fraction
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// ISO-8601
    #[serde(default)]
    pub started_at: Option<String>,
    /// ISO-8601
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

impl RawJobRecord {
    /// Convenience constructor for scripted backends and tests.
    pub fn new(id: JobId, status: &str, progress: f64) -> Self {
        Self {
            id,
            status: Some(status.to_string()),
            progress: Some(progress),
            ..Default::default()
        }
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalizes a raw record into the canonical [`Job`].
///
/// Rules:
/// - status is lower-cased; unknown values map to `Pending`
/// - `progress > 1` is treated as a percentage and divided by 100, then
///   clamped to `[0, 1]`; a `Completed` job always reads `1.0`
/// - an `error_message` of the form `"Stage: <text>"` moves `<text>` into
///   `stage` and clears the error
/// - unparseable timestamps become `None`
pub fn normalize(raw: RawJobRecord) -> Job {
    let status = raw
        .status
        .as_deref()
        .map(JobStatus::parse)
        .unwrap_or_default();

    let mut progress = raw.progress.unwrap_or(0.0);
    if progress > 1.0 {
        progress /= 100.0;
    }
    progress = progress.clamp(0.0, 1.0);
    if status == JobStatus::Completed {
        progress = 1.0;
    }

    let (stage, error_message) = decode_stage(raw.stage, raw.error_message);

    Job {
        id: raw.id,
        parent_id: raw.parent_id,
        status,
        progress,
        stage,
        error_message,
        started_at: parse_timestamp(raw.started_at.as_deref()),
        completed_at: parse_timestamp(raw.completed_at.as_deref()),
        metadata: raw.metadata,
    }
}

/// Decodes the legacy stage-in-error-message encoding.
fn decode_stage(
    stage: Option<String>,
    error_message: Option<String>,
) -> (Option<String>, Option<String>) {
    match error_message {
        Some(msg) => match msg.strip_prefix(STAGE_PREFIX) {
            Some(rest) => (Some(rest.to_string()), None),
            None => (stage, Some(msg)),
        },
        None => (stage, None),
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_percentage_progress() {
        let job = normalize(RawJobRecord::new(1, "processing", 55.0));
        assert_eq!(job.progress, 0.55);
    }

    #[test]
    fn test_normalize_fraction_progress_unchanged() {
        let job = normalize(RawJobRecord::new(1, "processing", 0.55));
        assert_eq!(job.progress, 0.55);
    }

    #[test]
    fn test_normalize_clamps_progress() {
        // 250 -> 2.5 after rescale -> clamped to 1.0
        let job = normalize(RawJobRecord::new(1, "processing", 250.0));
        assert_eq!(job.progress, 1.0);

        let job = normalize(RawJobRecord::new(1, "processing", -0.2));
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_normalize_completed_forces_full_progress() {
        let job = normalize(RawJobRecord::new(1, "completed", 0.4));
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn test_normalize_decodes_legacy_stage() {
        let mut raw = RawJobRecord::new(1, "processing", 0.1);
        raw.error_message = Some("Stage: extracting audio".to_string());

        let job = normalize(raw);
        assert_eq!(job.stage.as_deref(), Some("extracting audio"));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_normalize_keeps_real_error_verbatim() {
        let mut raw = RawJobRecord::new(1, "failed", 0.3);
        raw.stage = Some("transcribing".to_string());
        raw.error_message = Some("model crashed".to_string());

        let job = normalize(raw);
        assert_eq!(job.stage.as_deref(), Some("transcribing"));
        assert_eq!(job.error_message.as_deref(), Some("model crashed"));
    }

    #[test]
    fn test_normalize_unknown_status_and_missing_fields() {
        let raw = RawJobRecord {
            id: 9,
            status: Some("Exploded".to_string()),
            ..Default::default()
        };

        let job = normalize(raw);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(job.stage.is_none());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_normalize_parses_timestamps() {
        let mut raw = RawJobRecord::new(1, "processing", 0.5);
        raw.started_at = Some("2026-03-01T10:00:00Z".to_string());
        raw.completed_at = Some("not a timestamp".to_string());

        let job = normalize(raw);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut raw = RawJobRecord::new(1, "processing", 55.0);
        raw.error_message = Some("Stage: aligning".to_string());
        raw.started_at = Some("2026-03-01T10:00:00Z".to_string());

        let first = normalize(raw);

        // Feed the canonical job back through as a raw record
        let again = normalize(RawJobRecord {
            id: first.id,
            parent_id: first.parent_id,
            status: Some(first.status.to_string()),
            progress: Some(first.progress),
            stage: first.stage.clone(),
            error_message: first.error_message.clone(),
            started_at: first.started_at.map(|t| t.to_rfc3339()),
            completed_at: first.completed_at.map(|t| t.to_rfc3339()),
            metadata: first.metadata.clone(),
        });

        assert_eq!(first, again);
    }
}
