//! Typed error hierarchy for the bookwright orchestrator.
//!
//! `PipelineError` is the single taxonomy every subsystem classifies into.
//! Each variant carries a fixed retriability and maps to a process exit
//! code, so the orchestrator can decide retry-vs-surface without string
//! matching and the CLI can exit per contract.

use std::path::PathBuf;

use thiserror::Error;

/// Exit codes of the `bookwright` binary.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const BAD_ARGS: i32 = 2;
    pub const LOCK_BUSY: i32 = 3;
    pub const SCHEMA_INVALID: i32 = 4;
    pub const CANCELLED: i32 = 5;
}

/// Categorized pipeline failures.
///
/// Retriability is a property of the variant, not of the call site; see
/// [`PipelineError::is_retriable`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Another orchestrator holds the write lock on the state document.
    #[error("State document is locked by another process: {path}")]
    Busy { path: PathBuf },

    /// Disk or file failure outside the state store's atomic protocol.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A phase exceeded its configured deadline.
    #[error("Phase {phase} timed out after {timeout_secs}s")]
    Timeout { phase: String, timeout_secs: u64 },

    /// A state write failed schema validation and was rejected.
    #[error("Invalid state patch for {phase}: {reason}")]
    InvalidPatch { phase: String, reason: String },

    /// Child phase process exited non-zero.
    #[error("Phase {phase} exited with code {exit_code}: {message}")]
    ChildExit {
        phase: String,
        exit_code: i32,
        message: String,
    },

    /// Outcome check found a referenced artifact missing or empty.
    #[error("Phase {phase} artifact missing or empty: {path}")]
    ArtifactMissing { phase: String, path: PathBuf },

    /// One or more chunks failed validation inside a chunked phase.
    #[error("Phase {phase}: {failed} of {total} chunks failed")]
    ChunkFailure {
        phase: String,
        failed: usize,
        total: usize,
    },

    /// Cancellation was requested by the user.
    #[error("Run cancelled during {phase}")]
    Cancelled { phase: String },

    /// An advisor safety gate rejected an override application.
    #[error("Advisor override blocked by safety gate: {gate}")]
    SafetyBlocked { gate: String },

    /// The on-disk state document failed validation even after
    /// canonicalization and backup fallback.
    #[error("Corrupt state document at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },
}

impl PipelineError {
    /// Short kind label used in telemetry and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Busy { .. } => "busy",
            PipelineError::Io { .. } => "io_error",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::InvalidPatch { .. } => "invalid_patch",
            PipelineError::ChildExit { .. } => "child_exit",
            PipelineError::ArtifactMissing { .. } => "artifact_missing",
            PipelineError::ChunkFailure { .. } => "chunk_failure",
            PipelineError::Cancelled { .. } => "cancelled",
            PipelineError::SafetyBlocked { .. } => "safety_blocked",
            PipelineError::CorruptState { .. } => "corrupt_state",
        }
    }

    /// Whether the retry engine may schedule another attempt for this kind.
    ///
    /// `ChildExit` is "sometimes retriable" per the taxonomy: the runner
    /// downgrades it to non-retriable when the structured result reports a
    /// permanent category (e.g. unsupported input).
    pub fn is_retriable(&self) -> bool {
        match self {
            PipelineError::Busy { .. }
            | PipelineError::Io { .. }
            | PipelineError::Timeout { .. }
            | PipelineError::ChildExit { .. }
            | PipelineError::ArtifactMissing { .. }
            | PipelineError::ChunkFailure { .. } => true,
            PipelineError::InvalidPatch { .. }
            | PipelineError::Cancelled { .. }
            | PipelineError::SafetyBlocked { .. }
            | PipelineError::CorruptState { .. } => false,
        }
    }

    /// Process exit code for this error when it is the terminal outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Busy { .. } => exit::LOCK_BUSY,
            PipelineError::InvalidPatch { .. } | PipelineError::CorruptState { .. } => {
                exit::SCHEMA_INVALID
            }
            PipelineError::Cancelled { .. } => exit::CANCELLED,
            _ => exit::FAILURE,
        }
    }
}
