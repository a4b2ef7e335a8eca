//! Canonical state document model.
//!
//! One `PipelineState` per book, serialized to `pipeline.json`. The document
//! is the single source of truth for resume, cross-phase handoff, and
//! telemetry aggregation. Unknown fields are preserved on round-trip
//! (`#[serde(flatten)]` catch-alls) so newer writers never destroy data a
//! future schema version understands.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::phase::PhaseLabel;
use crate::util::sha256_hex;

/// Current schema version. Version 1 stored chunks as flat arrays and
/// overrides as a list; `canonicalize` promotes both.
pub const SCHEMA_VERSION: u32 = 2;

/// Status of a phase block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    /// Prior successful output was adopted without re-running the phase.
    Reused,
    /// The run was cancelled while this phase was in flight.
    Cancelled,
}

impl PhaseStatus {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, PhaseStatus::Success | PhaseStatus::Reused)
    }
}

/// Status of a single chunk of resumable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    #[default]
    Pending,
    Success,
    Failed,
    /// Recovered after failure via a repair strategy. Kept distinct from
    /// `Success` so audits can tell first-try output from recoveries.
    Repaired,
}

impl ChunkStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, ChunkStatus::Success | ChunkStatus::Repaired)
    }
}

/// Where an override came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideSource {
    Baseline,
    User,
    Advisor,
    SelfDriving,
    Experiment,
}

/// Override lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverrideTtl {
    /// Cleared when the run reaches a terminal outcome.
    #[default]
    SingleRun,
    /// Survives the run; only written under autonomous learning.
    Persistent,
}

/// Source file identity and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceInfo {
    pub path: String,
    /// SHA-256 of the source content.
    pub hash: String,
    pub mime: String,
    pub size_bytes: u64,
}

/// Truncated error snapshot stored in phase blocks and runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// A file the phase produced, with enough identity to verify reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Provenance for one failed attempt on a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub category: String,
    pub phase: PhaseLabel,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// Pointer into the per-phase log file, when an excerpt was captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
}

/// One unit of resumable work inside a chunked phase.
///
/// Chunk ids are the map keys in [`PhaseBlock::chunks`]; the map's ascending
/// order defines concatenation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChunkRecord {
    pub status: ChunkStatus,
    /// Content hash of the chunk text (synthesis phases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    /// Replacement artifact from the repair loop. The original at
    /// `artifact_path` is never deleted; substitution is by reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repaired_artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Real-time factor, validation scores and similar per-chunk metrics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChunkRecord {
    /// The artifact path final assembly should read: the repair replacement
    /// when one was accepted, the original otherwise.
    pub fn effective_artifact_path(&self) -> Option<&str> {
        self.repaired_artifact_path
            .as_deref()
            .or(self.artifact_path.as_deref())
    }
}

/// Per-phase state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PhaseBlock {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    /// Content hash of the inputs this phase consumed; drives reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
    /// Chunk records keyed by chunk id. BTreeMap keeps iteration in
    /// ascending id order, which is the concatenation order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chunks: BTreeMap<u32, ChunkRecord>,
    /// Fields from other writers or future schema versions, preserved as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PhaseBlock {
    pub fn chunk_total(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks_with_status(&self, status: ChunkStatus) -> usize {
        self.chunks.values().filter(|c| c.status == status).count()
    }

    pub fn chunks_usable(&self) -> usize {
        self.chunks.values().filter(|c| c.status.is_usable()).count()
    }

    pub fn failed_chunk_ids(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|(_, c)| c.status == ChunkStatus::Failed)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// A parameter value superseding baseline configuration for one run (or
/// persistently under autonomous learning).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub target_phase: PhaseLabel,
    pub parameter: String,
    pub value: Value,
    pub source: OverrideSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub ttl: OverrideTtl,
}

impl OverrideEntry {
    /// Key under which this entry lives in `PipelineState::overrides`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.target_phase, self.parameter)
    }
}

/// In-flight run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseLabel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Pid of the orchestrator holding this run; used to reap stale runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
}

/// History record of one batch invocation touching this book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Root state document, one per book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub file_id: String,
    pub source: SourceInfo,
    /// Phase blocks keyed by wire label (`phase1` .. `phase7`, `phase5.5`).
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseBlock>,
    /// Transient per-run overrides keyed by `<phase>.<parameter>`.
    #[serde(default)]
    pub overrides: BTreeMap<String, OverrideEntry>,
    #[serde(default)]
    pub runtime: RuntimeBlock,
    #[serde(default)]
    pub batch_runs: Vec<BatchRunRecord>,
    /// Unrecognized fields from older schema versions, parked by
    /// canonicalization instead of being dropped.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub legacy: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PipelineState {
    pub fn new(file_id: impl Into<String>, source: SourceInfo) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            file_id: file_id.into(),
            source,
            phases: BTreeMap::new(),
            overrides: BTreeMap::new(),
            runtime: RuntimeBlock::default(),
            batch_runs: Vec::new(),
            legacy: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn phase(&self, label: PhaseLabel) -> Option<&PhaseBlock> {
        self.phases.get(label.as_str())
    }

    /// Phase block for `label`, created as `pending` if absent.
    pub fn phase_mut(&mut self, label: PhaseLabel) -> &mut PhaseBlock {
        self.phases.entry(label.as_str().to_string()).or_default()
    }

    pub fn phase_status(&self, label: PhaseLabel) -> PhaseStatus {
        self.phase(label).map(|b| b.status).unwrap_or_default()
    }

    /// Remove all single-run overrides, keeping persistent ones.
    /// Returns how many entries were cleared.
    pub fn clear_single_run_overrides(&mut self) -> usize {
        let before = self.overrides.len();
        self.overrides
            .retain(|_, entry| entry.ttl == OverrideTtl::Persistent);
        before - self.overrides.len()
    }

    /// Overrides targeting one phase, in deterministic key order.
    pub fn overrides_for(&self, label: PhaseLabel) -> Vec<&OverrideEntry> {
        self.overrides
            .values()
            .filter(|o| o.target_phase == label)
            .collect()
    }

    /// Content hash of the canonical serialization. Used in the transaction
    /// log and by the atomicity tests.
    pub fn content_hash(&self) -> String {
        // BTreeMap fields make serde_json output key-stable.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&bytes)
    }
}
