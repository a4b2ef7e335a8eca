//! Runtime configuration for one orchestrator invocation.
//!
//! Bridges the layered [`PipelineToml`] with the CLI layer and resolves the
//! on-disk layout (state document, metadata directory) for a book.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::phase::{PhaseFlag, PhaseLabel, phase_spec};
use crate::pipeline_config::{LearningMode, PipelineToml};
use crate::state::{OverrideEntry, OverrideSource, OverrideTtl};

/// CLI-layer values that supersede the file and environment layers.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub voice: Option<String>,
    pub engine: Option<String>,
    pub max_retries: Option<u32>,
    pub learning_mode: Option<LearningMode>,
    pub phases: Option<Vec<PhaseLabel>>,
    pub resume: Option<bool>,
}

/// Resolved configuration for one run on one book.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source file; `None` when operating on an existing state document
    /// only (status, repair, cancel).
    pub input_path: Option<PathBuf>,
    pub state_path: PathBuf,
    pub workdir: PathBuf,
    pub phases: Vec<PhaseLabel>,
    pub resume: Option<bool>,
    pub learning_mode: LearningMode,
    pub verbose: bool,
    pub toml: PipelineToml,
    cli: CliOverrides,
}

impl Config {
    /// Resolve configuration for an input file. The state document defaults
    /// to `<input_dir>/<input_stem>/pipeline.json` unless `--pipeline-json`
    /// was given.
    pub fn for_input(
        input_path: PathBuf,
        pipeline_json: Option<PathBuf>,
        cli: CliOverrides,
        verbose: bool,
    ) -> Result<Self> {
        let input_path = input_path
            .canonicalize()
            .with_context(|| format!("Failed to resolve input path: {}", input_path.display()))?;
        let state_path = match pipeline_json {
            Some(path) => path,
            None => {
                let stem = input_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context("Input path has no usable file stem")?;
                input_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(stem)
                    .join("pipeline.json")
            }
        };
        Self::build(Some(input_path), state_path, cli, verbose)
    }

    /// Resolve configuration for an existing state document.
    pub fn for_state_path(
        state_path: PathBuf,
        cli: CliOverrides,
        verbose: bool,
    ) -> Result<Self> {
        Self::build(None, state_path, cli, verbose)
    }

    fn build(
        input_path: Option<PathBuf>,
        state_path: PathBuf,
        cli: CliOverrides,
        verbose: bool,
    ) -> Result<Self> {
        let workdir = state_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&workdir)
            .with_context(|| format!("Failed to create workdir: {}", workdir.display()))?;

        let toml = PipelineToml::load_or_default(&workdir);
        let learning_mode = cli.learning_mode.unwrap_or(toml.defaults.learning_mode);
        let phases = cli.phases.clone().unwrap_or_else(|| {
            PhaseLabel::all()
                .iter()
                .copied()
                .filter(|p| !p.is_optional() || toml.defaults.normalize)
                .collect()
        });

        Ok(Self {
            input_path,
            state_path,
            workdir,
            phases,
            resume: cli.resume,
            learning_mode,
            verbose,
            toml,
            cli,
        })
    }

    /// Effective retry budget for a phase (CLI beats file beats roster).
    pub fn retry_budget(&self, label: PhaseLabel) -> u32 {
        self.cli
            .max_retries
            .unwrap_or_else(|| self.toml.retry_budget(label))
    }

    pub fn timeout_secs(&self, label: PhaseLabel) -> u64 {
        self.toml.timeout_secs(label)
    }

    /// User-sourced single-run overrides materialized from CLI flags, for
    /// every selected phase whose flag surface accepts the parameter.
    pub fn user_overrides(&self) -> Vec<OverrideEntry> {
        let mut entries = Vec::new();
        for label in &self.phases {
            let spec = phase_spec(*label);
            if let Some(voice) = &self.cli.voice
                && spec.accepts_flag(PhaseFlag::Voice)
            {
                entries.push(OverrideEntry {
                    target_phase: *label,
                    parameter: "voice".into(),
                    value: Value::String(voice.clone()),
                    source: OverrideSource::User,
                    reason: Some("--voice".into()),
                    ttl: OverrideTtl::SingleRun,
                });
            }
            if let Some(engine) = &self.cli.engine
                && spec.accepts_flag(PhaseFlag::Engine)
            {
                entries.push(OverrideEntry {
                    target_phase: *label,
                    parameter: "engine".into(),
                    value: Value::String(engine.clone()),
                    source: OverrideSource::User,
                    reason: Some("--engine".into()),
                    ttl: OverrideTtl::SingleRun,
                });
            }
            if let Some(retries) = self.cli.max_retries
                && spec.accepts_flag(PhaseFlag::MaxRetries)
            {
                entries.push(OverrideEntry {
                    target_phase: *label,
                    parameter: "max_retries".into(),
                    value: Value::from(retries),
                    source: OverrideSource::User,
                    reason: Some("--max-retries".into()),
                    ttl: OverrideTtl::SingleRun,
                });
            }
        }
        entries
    }

    /// Baseline parameter value used by drift checks and flag injection.
    pub fn baseline_parameter(&self, parameter: &str) -> Option<Value> {
        match parameter {
            "engine" => Some(Value::String(self.toml.defaults.engine.clone())),
            "voice" => Some(Value::String(self.toml.defaults.voice.clone())),
            "chunk_chars" => Some(Value::from(self.toml.defaults.chunk_chars)),
            "max_retries" => Some(Value::from(
                self.toml.defaults.max_retries.unwrap_or(3),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_state_path_derived_from_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("moby-dick.epub");
        fs::write(&input, b"book").unwrap();

        let config =
            Config::for_input(input.clone(), None, CliOverrides::default(), false).unwrap();
        assert!(config.state_path.ends_with("moby-dick/pipeline.json"));
        assert!(config.workdir.is_dir());
        assert_eq!(config.input_path.as_deref(), Some(input.canonicalize().unwrap().as_path()));
    }

    #[test]
    fn test_explicit_pipeline_json_wins() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("b.txt");
        fs::write(&input, b"x").unwrap();
        let explicit = dir.path().join("elsewhere/state.json");

        let config = Config::for_input(
            input,
            Some(explicit.clone()),
            CliOverrides::default(),
            false,
        )
        .unwrap();
        assert_eq!(config.state_path, explicit);
    }

    #[test]
    fn test_optional_phase_excluded_by_default() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("b.txt");
        fs::write(&input, b"x").unwrap();
        let config = Config::for_input(input, None, CliOverrides::default(), false).unwrap();
        assert!(!config.phases.contains(&PhaseLabel::Normalize));
        assert_eq!(config.phases.len(), 7);
    }

    #[test]
    fn test_cli_phase_subset_respected() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("b.txt");
        fs::write(&input, b"x").unwrap();
        let cli = CliOverrides {
            phases: Some(vec![PhaseLabel::Extract, PhaseLabel::Segment]),
            ..Default::default()
        };
        let config = Config::for_input(input, None, cli, false).unwrap();
        assert_eq!(
            config.phases,
            vec![PhaseLabel::Extract, PhaseLabel::Segment]
        );
    }

    #[test]
    fn test_cli_max_retries_beats_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("b.txt");
        fs::write(&input, b"x").unwrap();
        let cli = CliOverrides {
            max_retries: Some(9),
            ..Default::default()
        };
        let config = Config::for_input(input, None, cli, false).unwrap();
        assert_eq!(config.retry_budget(PhaseLabel::Synthesize), 9);
    }

    #[test]
    fn test_user_overrides_respect_flag_surface() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("b.txt");
        fs::write(&input, b"x").unwrap();
        let cli = CliOverrides {
            engine: Some("kokoro".into()),
            ..Default::default()
        };
        let config = Config::for_input(input, None, cli, false).unwrap();
        let overrides = config.user_overrides();
        // Engine applies to prepare and synthesize only.
        let targets: Vec<PhaseLabel> = overrides.iter().map(|o| o.target_phase).collect();
        assert!(targets.contains(&PhaseLabel::Synthesize));
        assert!(targets.contains(&PhaseLabel::Prepare));
        assert!(!targets.contains(&PhaseLabel::Master));
        assert!(overrides.iter().all(|o| o.ttl == OverrideTtl::SingleRun));
    }
}
