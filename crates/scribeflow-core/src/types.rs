//! Scribeflow Core Type Definitions
//!
//! Defines fundamental identifier types used throughout the engine.

/// Backend-assigned job identifier.
///
/// The backend tracks one transcription job per file, so job ids live in the
/// same integer space as file ids.
pub type JobId = i64;

/// Backend-assigned file identifier (source files and split chunks).
pub type FileId = i64;

/// Progress fraction in `[0, 1]`.
pub type Progress = f64;
