//! Phase roster and per-phase execution surface.
//!
//! This module provides:
//! - `PhaseLabel` - the eight pipeline phases in dependency order
//! - `PhaseSpec` - static execution surface of a phase (command, flags,
//!   chunking, chunk-id base, default timeout and retry budget)
//! - `phase_roster()` - the canonical ordered roster

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Label of a pipeline phase. Ordering of the enum is dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PhaseLabel {
    /// Text extraction from the source document.
    #[serde(rename = "phase1")]
    Extract,
    /// Segmentation of extracted text into synthesis chunks.
    #[serde(rename = "phase2")]
    Segment,
    /// Voice and engine preparation (model cache, reference audio).
    #[serde(rename = "phase3")]
    Prepare,
    /// Speech synthesis. Chunked, resumable.
    #[serde(rename = "phase4")]
    Synthesize,
    /// Audio enhancement. Chunked, resumable.
    #[serde(rename = "phase5")]
    Enhance,
    /// Optional loudness normalization between enhancement and mastering.
    #[serde(rename = "phase5.5")]
    Normalize,
    /// Mastering and concatenation.
    #[serde(rename = "phase6")]
    Master,
    /// Final packaging (container, chapter marks).
    #[serde(rename = "phase7")]
    Package,
}

impl PhaseLabel {
    /// Stable wire label (`phase1` .. `phase7`, `phase5.5`), used as the key
    /// in the state document's `phases` map.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseLabel::Extract => "phase1",
            PhaseLabel::Segment => "phase2",
            PhaseLabel::Prepare => "phase3",
            PhaseLabel::Synthesize => "phase4",
            PhaseLabel::Enhance => "phase5",
            PhaseLabel::Normalize => "phase5.5",
            PhaseLabel::Master => "phase6",
            PhaseLabel::Package => "phase7",
        }
    }

    /// Human-readable phase name for summaries and logs.
    pub fn name(&self) -> &'static str {
        match self {
            PhaseLabel::Extract => "extract",
            PhaseLabel::Segment => "segment",
            PhaseLabel::Prepare => "prepare",
            PhaseLabel::Synthesize => "synthesize",
            PhaseLabel::Enhance => "enhance",
            PhaseLabel::Normalize => "normalize",
            PhaseLabel::Master => "master",
            PhaseLabel::Package => "package",
        }
    }

    /// All phases in dependency order. `Normalize` is optional and only
    /// scheduled when enabled in configuration.
    pub fn all() -> &'static [PhaseLabel] {
        &[
            PhaseLabel::Extract,
            PhaseLabel::Segment,
            PhaseLabel::Prepare,
            PhaseLabel::Synthesize,
            PhaseLabel::Enhance,
            PhaseLabel::Normalize,
            PhaseLabel::Master,
            PhaseLabel::Package,
        ]
    }

    /// Whether this phase is skipped unless explicitly enabled.
    pub fn is_optional(&self) -> bool {
        matches!(self, PhaseLabel::Normalize)
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PhaseLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase1" | "extract" => Ok(PhaseLabel::Extract),
            "phase2" | "segment" => Ok(PhaseLabel::Segment),
            "phase3" | "prepare" => Ok(PhaseLabel::Prepare),
            "phase4" | "synthesize" => Ok(PhaseLabel::Synthesize),
            "phase5" | "enhance" => Ok(PhaseLabel::Enhance),
            "phase5.5" | "normalize" => Ok(PhaseLabel::Normalize),
            "phase6" | "master" => Ok(PhaseLabel::Master),
            "phase7" | "package" => Ok(PhaseLabel::Package),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: phase1..phase7, phase5.5 or their names",
                s
            ),
        }
    }
}

/// Parameters a phase accepts on its command line (spec'd flag surface).
/// Overrides for parameters outside this set are injected as environment
/// variables instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseFlag {
    Resume,
    Voice,
    Engine,
    ChunkId,
    MaxRetries,
}

/// Static execution surface of a single phase.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub label: PhaseLabel,
    /// Default executable; overridable via `[phases.<label>] command` in
    /// configuration.
    pub command: &'static str,
    /// Whether the phase produces chunk records.
    pub chunked: bool,
    /// First chunk id of a non-empty chunk map. Synthesis inherits the
    /// 0-based ordering of the segmenter's output; enhancement numbers its
    /// tracks from 1. Validation enforces the base per phase.
    pub chunk_base: u32,
    /// Flags this phase understands beyond `--file_id`/`--json_path`.
    pub flags: &'static [PhaseFlag],
    pub default_timeout_secs: u64,
    pub default_retry_budget: u32,
}

impl PhaseSpec {
    pub fn accepts_flag(&self, flag: PhaseFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// The canonical phase roster in dependency order.
pub fn phase_roster() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec {
            label: PhaseLabel::Extract,
            command: "bw-extract",
            chunked: false,
            chunk_base: 0,
            flags: &[PhaseFlag::MaxRetries],
            default_timeout_secs: 1800,
            default_retry_budget: 2,
        },
        PhaseSpec {
            label: PhaseLabel::Segment,
            command: "bw-segment",
            chunked: false,
            chunk_base: 0,
            flags: &[PhaseFlag::MaxRetries],
            default_timeout_secs: 900,
            default_retry_budget: 2,
        },
        PhaseSpec {
            label: PhaseLabel::Prepare,
            command: "bw-prepare",
            chunked: false,
            chunk_base: 0,
            flags: &[PhaseFlag::Voice, PhaseFlag::Engine],
            default_timeout_secs: 3600,
            default_retry_budget: 2,
        },
        PhaseSpec {
            label: PhaseLabel::Synthesize,
            command: "bw-synthesize",
            chunked: true,
            chunk_base: 0,
            flags: &[
                PhaseFlag::Resume,
                PhaseFlag::Voice,
                PhaseFlag::Engine,
                PhaseFlag::ChunkId,
                PhaseFlag::MaxRetries,
            ],
            default_timeout_secs: 86400,
            default_retry_budget: 3,
        },
        PhaseSpec {
            label: PhaseLabel::Enhance,
            command: "bw-enhance",
            chunked: true,
            chunk_base: 1,
            flags: &[PhaseFlag::Resume, PhaseFlag::ChunkId, PhaseFlag::MaxRetries],
            default_timeout_secs: 43200,
            default_retry_budget: 3,
        },
        PhaseSpec {
            label: PhaseLabel::Normalize,
            command: "bw-normalize",
            chunked: false,
            chunk_base: 0,
            flags: &[],
            default_timeout_secs: 7200,
            default_retry_budget: 1,
        },
        PhaseSpec {
            label: PhaseLabel::Master,
            command: "bw-master",
            chunked: false,
            chunk_base: 0,
            flags: &[PhaseFlag::MaxRetries],
            default_timeout_secs: 14400,
            default_retry_budget: 2,
        },
        PhaseSpec {
            label: PhaseLabel::Package,
            command: "bw-package",
            chunked: false,
            chunk_base: 0,
            flags: &[],
            default_timeout_secs: 3600,
            default_retry_budget: 2,
        },
    ]
}

/// Look up the spec for a single phase.
pub fn phase_spec(label: PhaseLabel) -> PhaseSpec {
    phase_roster()
        .into_iter()
        .find(|s| s.label == label)
        .unwrap_or_else(|| unreachable!("roster covers every label"))
}
