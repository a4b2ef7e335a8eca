//! Policy engine: recommendations from telemetry, bounded application.
//!
//! The advisor is deliberately pure at its core: it consumes a folded
//! [`TelemetryWindow`] and returns recommendation values. The orchestrator
//! owns the run context and decides when to ask; the only state the advisor
//! touches itself is the append-only policy journal.

pub mod gates;
pub mod reward;
pub mod stats;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub use gates::{GateVerdict, check_gates, relative_delta};
pub use reward::{RunFacts, compute_reward};
pub use stats::{EngineStats, PhaseWindowStats, TelemetryWindow};

use crate::errors::PipelineError;
use crate::phase::PhaseLabel;
use crate::pipeline_config::{AdvisorSection, DefaultsSection, LearningMode};
use crate::state::{OverrideEntry, OverrideSource, OverrideTtl};

/// Margin by which an alternate engine must beat the baseline before a
/// swap is recommended.
const ENGINE_PROMOTION_MARGIN: f64 = 0.15;

/// Minimum completions before an engine's statistics are trusted.
const ENGINE_MIN_ATTEMPTS: usize = 3;

/// Chunk-size factor applied after repeated timeouts.
const TIMEOUT_CHUNK_FACTOR: f64 = 0.85;

/// Chunk-size factor applied against elevated chunk failure rates.
const FAILURE_CHUNK_FACTOR: f64 = 0.9;

/// A proposed parameter change, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub phase: PhaseLabel,
    pub parameter: String,
    pub proposed: Value,
    pub rationale: String,
    pub confidence: f64,
}

/// What happened to one recommendation at application time.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// Mode does not apply overrides; journaled only.
    Observed,
    /// Gates passed; the entry is ready for the override set.
    Applied(OverrideEntry),
    /// A safety gate rejected it.
    Blocked(&'static str),
}

/// One line of the daily policy journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyJournalEntry {
    pub timestamp: DateTime<Utc>,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed: Option<Value>,
    pub mode: LearningMode,
    /// `recommended`, `applied`, `blocked:<gate>`, or `reward`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Relative delta against baseline for numeric parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
}

pub struct Advisor {
    section: AdvisorSection,
    mode: LearningMode,
    journal_dir: PathBuf,
}

impl Advisor {
    pub fn new(section: AdvisorSection, mode: LearningMode, journal_dir: impl Into<PathBuf>) -> Self {
        Self {
            section,
            mode,
            journal_dir: journal_dir.into(),
        }
    }

    pub fn mode(&self) -> LearningMode {
        self.mode
    }

    pub fn window_days(&self) -> usize {
        self.section.window_days
    }

    /// Compute recommendations from the window against current defaults.
    pub fn recommend(
        &self,
        window: &TelemetryWindow,
        defaults: &DefaultsSection,
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        // Engine promotion: a consistently better alternate engine.
        if let Some((best, best_stats)) = window.best_engine(ENGINE_MIN_ATTEMPTS)
            && best != defaults.engine
        {
            let current_rate = window
                .engines
                .get(&defaults.engine)
                .map(|s| s.success_rate())
                .unwrap_or(0.0);
            if best_stats.success_rate() >= current_rate + ENGINE_PROMOTION_MARGIN {
                recommendations.push(Recommendation {
                    phase: PhaseLabel::Synthesize,
                    parameter: "engine".into(),
                    proposed: Value::String(best.to_string()),
                    rationale: format!(
                        "{} at {:.0}% success over {} attempts vs {:.0}% for {}",
                        best,
                        best_stats.success_rate() * 100.0,
                        best_stats.attempts,
                        current_rate * 100.0,
                        defaults.engine
                    ),
                    confidence: (best_stats.attempts as f64 / 10.0).min(1.0),
                });
            }
        }

        // Chunk-size reduction: timeouts first, then failure-rate creep.
        if let Some(stats) = window.phase(PhaseLabel::Synthesize) {
            let factor = if stats.timeouts > 0 {
                Some((
                    TIMEOUT_CHUNK_FACTOR,
                    format!("{} synthesis timeouts in window", stats.timeouts),
                ))
            } else if stats.chunk_failure_rate > 0.1 {
                Some((
                    FAILURE_CHUNK_FACTOR,
                    format!(
                        "chunk failure rate {:.0}% in window",
                        stats.chunk_failure_rate * 100.0
                    ),
                ))
            } else {
                None
            };
            if let Some((factor, rationale)) = factor {
                let proposed = (defaults.chunk_chars as f64 * factor).round() as u32;
                recommendations.push(Recommendation {
                    phase: PhaseLabel::Synthesize,
                    parameter: "chunk_chars".into(),
                    proposed: Value::from(proposed),
                    rationale,
                    confidence: (stats.attempts as f64 / 10.0).min(1.0),
                });
            }

            // Retry budget: retries that keep paying off earn one more slot.
            if stats.retries > 0 && stats.successes > stats.failures {
                let current = defaults.max_retries.unwrap_or(3);
                if current < 5 {
                    recommendations.push(Recommendation {
                        phase: PhaseLabel::Synthesize,
                        parameter: "max_retries".into(),
                        proposed: Value::from(current + 1),
                        rationale: format!(
                            "{} retries in window eventually succeeded",
                            stats.retries
                        ),
                        confidence: 0.5,
                    });
                }
            }
        }

        recommendations
    }

    /// Recommendation for the next attempt after a retriable failure,
    /// per the failure kind: engine swap on chunk failures, chunk-size
    /// reduction on timeouts.
    pub fn recommend_after_failure(
        &self,
        error: &PipelineError,
        defaults: &DefaultsSection,
        fallback_engines: &[String],
    ) -> Option<Recommendation> {
        match error {
            PipelineError::ChunkFailure { .. } => {
                let alternate = fallback_engines
                    .iter()
                    .find(|engine| **engine != defaults.engine)?;
                Some(Recommendation {
                    phase: PhaseLabel::Synthesize,
                    parameter: "engine".into(),
                    proposed: Value::String(alternate.clone()),
                    rationale: "chunk failures on current engine; swapping for retry".into(),
                    confidence: 0.6,
                })
            }
            PipelineError::Timeout { .. } => Some(Recommendation {
                phase: PhaseLabel::Synthesize,
                parameter: "chunk_chars".into(),
                proposed: Value::from(
                    (defaults.chunk_chars as f64 * TIMEOUT_CHUNK_FACTOR).round() as u32,
                ),
                rationale: "timeout; reducing chunk size for retry".into(),
                confidence: 0.6,
            }),
            _ => None,
        }
    }

    /// Gate one recommendation per the learning mode, journaling whatever
    /// happens. `baseline` is the current value of the parameter.
    pub fn gate_and_apply(
        &self,
        file_id: &str,
        window: &TelemetryWindow,
        recommendation: &Recommendation,
        baseline: Option<&Value>,
    ) -> Result<ApplyOutcome, PipelineError> {
        if !self.mode.applies_overrides() {
            self.journal(&self.entry_for(
                file_id,
                recommendation,
                baseline,
                "recommended".into(),
                None,
            ))?;
            return Ok(ApplyOutcome::Observed);
        }

        let cumulative = self.cumulative_drift(&recommendation.parameter)?;
        let verdict = check_gates(
            &self.section,
            window,
            baseline,
            &recommendation.proposed,
            cumulative,
        );
        match verdict {
            GateVerdict::Pass => {
                let (source, ttl) = match self.mode {
                    LearningMode::Autonomous => {
                        (OverrideSource::SelfDriving, OverrideTtl::Persistent)
                    }
                    _ => (OverrideSource::Advisor, OverrideTtl::SingleRun),
                };
                let entry = OverrideEntry {
                    target_phase: recommendation.phase,
                    parameter: recommendation.parameter.clone(),
                    value: recommendation.proposed.clone(),
                    source,
                    reason: Some(recommendation.rationale.clone()),
                    ttl,
                };
                self.journal(&self.entry_for(
                    file_id,
                    recommendation,
                    baseline,
                    "applied".into(),
                    None,
                ))?;
                info!(
                    parameter = %recommendation.parameter,
                    value = %recommendation.proposed,
                    "advisor override applied"
                );
                Ok(ApplyOutcome::Applied(entry))
            }
            GateVerdict::Blocked(gate) => {
                self.journal(&self.entry_for(
                    file_id,
                    recommendation,
                    baseline,
                    format!("blocked:{}", gate),
                    None,
                ))?;
                info!(gate, parameter = %recommendation.parameter, "advisor override blocked");
                Ok(ApplyOutcome::Blocked(gate))
            }
        }
    }

    /// Journal the run's reward so rolling statistics can steer tuning.
    pub fn journal_reward(&self, file_id: &str, reward: f64) -> Result<(), PipelineError> {
        self.journal(&PolicyJournalEntry {
            timestamp: Utc::now(),
            file_id: file_id.to_string(),
            phase: None,
            parameter: None,
            proposed: None,
            mode: self.mode,
            outcome: "reward".into(),
            rationale: None,
            confidence: None,
            delta: None,
            reward: Some(reward),
        })
    }

    fn entry_for(
        &self,
        file_id: &str,
        recommendation: &Recommendation,
        baseline: Option<&Value>,
        outcome: String,
        reward: Option<f64>,
    ) -> PolicyJournalEntry {
        PolicyJournalEntry {
            timestamp: Utc::now(),
            file_id: file_id.to_string(),
            phase: Some(recommendation.phase),
            parameter: Some(recommendation.parameter.clone()),
            proposed: Some(recommendation.proposed.clone()),
            mode: self.mode,
            outcome,
            rationale: Some(recommendation.rationale.clone()),
            confidence: Some(recommendation.confidence),
            delta: baseline.and_then(|b| relative_delta(b, &recommendation.proposed)),
            reward,
        }
    }

    fn journal_file(&self, timestamp: &DateTime<Utc>) -> PathBuf {
        self.journal_dir
            .join(format!("{}.log", timestamp.format("%Y%m%d")))
    }

    /// Append one journal line (same O_APPEND discipline as telemetry).
    pub fn journal(&self, entry: &PolicyJournalEntry) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.journal_dir).map_err(|source| PipelineError::Io {
            path: self.journal_dir.clone(),
            source,
        })?;
        let path = self.journal_file(&entry.timestamp);
        let mut line = serde_json::to_string(entry).map_err(|e| PipelineError::CorruptState {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PipelineError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| PipelineError::Io { path, source })
    }

    /// Journal entries from the most recent `days` daily files.
    pub fn read_journal(&self, days: usize) -> Result<Vec<PolicyJournalEntry>, PipelineError> {
        read_journal_dir(&self.journal_dir, days)
    }

    /// Sum of applied relative deltas for `parameter` across the window.
    fn cumulative_drift(&self, parameter: &str) -> Result<f64, PipelineError> {
        Ok(self
            .read_journal(self.section.window_days)?
            .iter()
            .filter(|e| e.outcome == "applied" && e.parameter.as_deref() == Some(parameter))
            .filter_map(|e| e.delta)
            .sum())
    }
}

/// Read a policy journal directory; shared with the `advisor report`
/// subcommand.
pub fn read_journal_dir(
    dir: &Path,
    days: usize,
) -> Result<Vec<PolicyJournalEntry>, PipelineError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
        .collect();
    files.sort();
    let keep = files.len().saturating_sub(days);
    let mut entries = Vec::new();
    for file in &files[keep..] {
        let content = std::fs::read_to_string(file).map_err(|source| PipelineError::Io {
            path: file.clone(),
            source,
        })?;
        entries.extend(
            content
                .lines()
                .filter_map(|line| serde_json::from_str::<PolicyJournalEntry>(line).ok()),
        );
    }
    Ok(entries)
}
