//! Canonical state document: model, schema, and atomic store.
//!
//! Persistence ownership in this crate:
//!
//! | Layer                | What it persists                                   |
//! |----------------------|----------------------------------------------------|
//! | `state/store.rs`     | The state document, transaction log, backups       |
//! | `telemetry.rs`       | Append-only event log (observation, no control flow)|
//! | `repair/registry.rs` | Chunk failure registry and repair manifests        |
//! | `advisor`            | Policy journal (recommendations, rewards)          |
//!
//! The state document is the canonical source of truth for resume and for
//! cross-phase handoff. Everything else is an append-only observation layer.

pub mod model;
pub mod schema;
pub mod store;

pub use model::{
    ArtifactRef, BatchRunRecord, ChunkRecord, ChunkStatus, ErrorInfo, FailureRecord,
    OverrideEntry, OverrideSource, OverrideTtl, PhaseBlock, PhaseStatus, PipelineState,
    RuntimeBlock, SCHEMA_VERSION, SourceInfo,
};
pub use schema::{SchemaViolation, canonicalize, merge_patch, validate_strict, validate_structural};
pub use store::{StateLock, StateStore, TransactionEntry};
