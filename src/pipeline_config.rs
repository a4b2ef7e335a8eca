//! Unified configuration loaded from `bookwright.toml`.
//!
//! Layering is `defaults <- file <- environment <- CLI <- advisor`; this
//! module owns the first three layers. CLI flags are merged by
//! [`crate::config::Config`], advisor overrides at run start by the
//! orchestrator. Unknown keys in the file are preserved under `legacy`
//! rather than rejected, mirroring the state document's forward
//! compatibility rules.
//!
//! ```toml
//! [defaults]
//! engine = "styletts2"
//! voice = "en-us-ryan"
//! learning_mode = "observe"
//!
//! [phases.phase4]
//! timeout_secs = 43200
//! max_retries = 4
//!
//! [repair]
//! enabled = true
//! confidence_threshold = 0.85
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::phase::PhaseLabel;

/// How far the advisor may go with its recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LearningMode {
    /// Write recommendations to telemetry only.
    #[default]
    Observe,
    /// Surface recommendations in the run report for human approval.
    Recommend,
    /// Apply recommendations as single-run overrides behind safety gates.
    Supervised,
    /// As supervised, and may persist accepted recommendations.
    Autonomous,
}

impl LearningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningMode::Observe => "observe",
            LearningMode::Recommend => "recommend",
            LearningMode::Supervised => "supervised",
            LearningMode::Autonomous => "autonomous",
        }
    }

    /// Whether this mode is allowed to mutate the override set at all.
    pub fn applies_overrides(&self) -> bool {
        matches!(self, LearningMode::Supervised | LearningMode::Autonomous)
    }
}

impl std::fmt::Display for LearningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LearningMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "observe" => Ok(LearningMode::Observe),
            "recommend" => Ok(LearningMode::Recommend),
            "supervised" => Ok(LearningMode::Supervised),
            "autonomous" => Ok(LearningMode::Autonomous),
            _ => anyhow::bail!(
                "Invalid learning mode '{}'. Valid values: observe, recommend, supervised, autonomous",
                s
            ),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub engine: String,
    pub voice: String,
    pub max_retries: Option<u32>,
    pub learning_mode: LearningMode,
    pub lock_wait_secs: u64,
    pub backup_retention: usize,
    /// Schedule the optional loudness-normalization phase.
    pub normalize: bool,
    /// Seed forwarded to seeded synthesis engines; part of phase4's
    /// inputs hash so reuse stays sound.
    pub synthesis_seed: u64,
    /// Target chunk size handed to the segmenter, in characters.
    pub chunk_chars: u32,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            engine: "styletts2".to_string(),
            voice: "en-us-ryan".to_string(),
            max_retries: None,
            learning_mode: LearningMode::default(),
            lock_wait_secs: 10,
            backup_retention: 5,
            normalize: false,
            synthesis_seed: 0,
            chunk_chars: 2000,
        }
    }
}

/// `[phases.<label>]` override of a phase's execution surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PhaseSection {
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    /// Extra environment variables for the child process.
    pub env: BTreeMap<String, String>,
}

/// `[repair]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairSection {
    pub enabled: bool,
    pub confidence_threshold: f64,
    pub duration_weight: f64,
    pub validation_weight: f64,
    /// Maximum sub-units the sub-split strategy may produce per chunk.
    pub max_sub_splits: usize,
    /// Silence inserted between concatenated sub-units, in milliseconds.
    pub silence_ms: u32,
    /// Alternate engines the engine-switch strategy may try, in order.
    pub fallback_engines: Vec<String>,
    /// External rewriter command; enables the text-rewrite strategy.
    pub rewrite_command: Option<String>,
}

impl Default for RepairSection {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.85,
            duration_weight: 0.6,
            validation_weight: 0.4,
            max_sub_splits: 8,
            silence_ms: 120,
            fallback_engines: vec!["kokoro".to_string()],
            rewrite_command: None,
        }
    }
}

/// `[advisor]` section: safety gates and window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorSection {
    /// Minimum recent successful runs before overrides may apply.
    pub readiness_min_runs: usize,
    /// Rolling failure rate above which overrides are blocked.
    pub failure_rate_threshold: f64,
    /// Bound on a single proposed delta, as a fraction of baseline.
    pub drift_bound: f64,
    /// Bound on cumulative drift across the window, as a fraction.
    pub drift_budget: f64,
    /// Telemetry window, in days.
    pub window_days: usize,
}

impl Default for AdvisorSection {
    fn default() -> Self {
        Self {
            readiness_min_runs: 5,
            failure_rate_threshold: 0.35,
            drift_bound: 0.25,
            drift_budget: 0.5,
            window_days: 14,
        }
    }
}

/// `[hooks]` section: post-phase commands, never blocking.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HooksSection {
    pub post_phase: Vec<String>,
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BatchSection {
    /// Books processed concurrently; 0 means number of CPU cores.
    pub max_parallel: usize,
}

/// The whole `bookwright.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineToml {
    pub defaults: DefaultsSection,
    pub phases: BTreeMap<String, PhaseSection>,
    pub repair: RepairSection,
    pub advisor: AdvisorSection,
    pub hooks: HooksSection,
    pub batch: BatchSection,
    #[serde(flatten)]
    pub legacy: BTreeMap<String, toml::Value>,
}

impl PipelineToml {
    /// Load from a file, then apply the `BOOKWRIGHT_*` environment layer.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: PipelineToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Load the config next to the state document if present, defaults
    /// otherwise. The environment layer applies in both cases.
    pub fn load_or_default(workdir: &Path) -> Self {
        let path = workdir.join("bookwright.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable bookwright.toml");
                }
            }
        }
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(engine) = std::env::var("BOOKWRIGHT_ENGINE") {
            self.defaults.engine = engine;
        }
        if let Ok(voice) = std::env::var("BOOKWRIGHT_VOICE") {
            self.defaults.voice = voice;
        }
        if let Ok(mode) = std::env::var("BOOKWRIGHT_LEARNING_MODE")
            && let Ok(mode) = mode.parse()
        {
            self.defaults.learning_mode = mode;
        }
        if let Ok(retries) = std::env::var("BOOKWRIGHT_MAX_RETRIES")
            && let Ok(retries) = retries.parse()
        {
            self.defaults.max_retries = Some(retries);
        }
    }

    /// Per-phase section, empty when the file does not mention the phase.
    pub fn phase_section(&self, label: PhaseLabel) -> PhaseSection {
        self.phases.get(label.as_str()).cloned().unwrap_or_default()
    }

    /// Effective timeout for a phase: file override or roster default.
    pub fn timeout_secs(&self, label: PhaseLabel) -> u64 {
        self.phase_section(label)
            .timeout_secs
            .unwrap_or_else(|| crate::phase::phase_spec(label).default_timeout_secs)
    }

    /// Effective retry budget: phase section, then `[defaults]`, then the
    /// roster default.
    pub fn retry_budget(&self, label: PhaseLabel) -> u32 {
        self.phase_section(label)
            .max_retries
            .or(self.defaults.max_retries)
            .unwrap_or_else(|| crate::phase::phase_spec(label).default_retry_budget)
    }

    /// Effective command for a phase.
    pub fn phase_command(&self, label: PhaseLabel) -> String {
        self.phase_section(label)
            .command
            .unwrap_or_else(|| crate::phase::phase_spec(label).command.to_string())
    }

    /// Starter config written by `bookwright init`.
    pub fn starter_toml() -> &'static str {
        r#"# bookwright configuration

[defaults]
engine = "styletts2"
voice = "en-us-ryan"
learning_mode = "observe"

[repair]
enabled = false
confidence_threshold = 0.85

[advisor]
readiness_min_runs = 5
failure_rate_threshold = 0.35
drift_bound = 0.25

[batch]
max_parallel = 0
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_sensible() {
        let config = PipelineToml::default();
        assert_eq!(config.defaults.learning_mode, LearningMode::Observe);
        assert_eq!(config.repair.confidence_threshold, 0.85);
        assert_eq!(config.advisor.readiness_min_runs, 5);
        assert!(!config.repair.enabled);
    }

    #[test]
    fn test_load_overrides_and_preserves_unknown_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bookwright.toml");
        std::fs::write(
            &path,
            r#"
[defaults]
engine = "kokoro"
chunk_chars = 1500

[phases.phase4]
timeout_secs = 7200
max_retries = 5

[experimental_dsp]
shimmer = true
"#,
        )
        .unwrap();

        let config = PipelineToml::load(&path).unwrap();
        assert_eq!(config.defaults.engine, "kokoro");
        assert_eq!(config.defaults.chunk_chars, 1500);
        assert_eq!(config.timeout_secs(PhaseLabel::Synthesize), 7200);
        assert_eq!(config.retry_budget(PhaseLabel::Synthesize), 5);
        assert!(config.legacy.contains_key("experimental_dsp"));
    }

    #[test]
    fn test_layer_precedence_roster_then_defaults_then_phase() {
        let mut config = PipelineToml::default();
        // Roster default when nothing is configured.
        assert_eq!(config.retry_budget(PhaseLabel::Extract), 2);
        config.defaults.max_retries = Some(7);
        assert_eq!(config.retry_budget(PhaseLabel::Extract), 7);
        config.phases.insert(
            "phase1".into(),
            PhaseSection {
                max_retries: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(config.retry_budget(PhaseLabel::Extract), 1);
    }

    #[test]
    fn test_phase_command_override() {
        let mut config = PipelineToml::default();
        assert_eq!(config.phase_command(PhaseLabel::Extract), "bw-extract");
        config.phases.insert(
            "phase1".into(),
            PhaseSection {
                command: Some("/opt/tts/extract.sh".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            config.phase_command(PhaseLabel::Extract),
            "/opt/tts/extract.sh"
        );
    }

    #[test]
    fn test_learning_mode_parse() {
        assert_eq!(
            "supervised".parse::<LearningMode>().unwrap(),
            LearningMode::Supervised
        );
        assert!("turbo".parse::<LearningMode>().is_err());
        assert!(LearningMode::Autonomous.applies_overrides());
        assert!(!LearningMode::Recommend.applies_overrides());
    }

    #[test]
    fn test_starter_toml_parses() {
        let config: PipelineToml = toml::from_str(PipelineToml::starter_toml()).unwrap();
        assert_eq!(config.defaults.engine, "styletts2");
        assert_eq!(config.batch.max_parallel, 0);
    }
}
