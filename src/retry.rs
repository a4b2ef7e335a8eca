//! Skip / resume / fresh decisions and retry scheduling.
//!
//! For each phase invocation the engine decides how to enter the phase,
//! and after a failure whether another attempt is allowed. Budgets are per
//! phase; backoff is exponential with jitter so a batch of books does not
//! retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::errors::PipelineError;
use crate::phase::{PhaseLabel, phase_spec};
use crate::state::{PipelineState, StateStore};

/// How the orchestrator should enter a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    /// Reuse the prior successful result; do not launch the phase.
    Skip,
    /// Launch with `--resume`; the phase produces only missing chunks.
    Resume,
    /// Launch from scratch.
    Fresh,
}

/// Base delay for the first retry; attempt N waits `base * 2^(N-1)` plus
/// jitter, capped at `MAX_BACKOFF`.
const BASE_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct RetryEngine;

impl RetryEngine {
    /// Decide how to enter `label` for the given inputs.
    ///
    /// `force_resume`: `Some(true)` forces resume behavior where possible,
    /// `Some(false)` (`--no-resume`) forbids both skip and resume.
    pub fn decide(
        store: &StateStore,
        label: PhaseLabel,
        inputs_hash: &str,
        force_resume: Option<bool>,
    ) -> Result<RunDecision, PipelineError> {
        if force_resume == Some(false) {
            return Ok(RunDecision::Fresh);
        }

        if store.can_reuse(label, inputs_hash)? {
            return Ok(RunDecision::Skip);
        }

        let state = store.read()?;
        if Self::is_resumable(&state, label) {
            return Ok(RunDecision::Resume);
        }
        Ok(RunDecision::Fresh)
    }

    /// A chunked phase with at least one usable chunk re-enters with
    /// `--resume` so prior work is not re-synthesized.
    fn is_resumable(state: &PipelineState, label: PhaseLabel) -> bool {
        if !phase_spec(label).chunked {
            return false;
        }
        match state.phase(label) {
            Some(block) => {
                !block.status.is_terminal_success()
                    && block.chunks_usable() > 0
            }
            None => false,
        }
    }

    /// Whether another attempt is allowed after `error` on attempt
    /// `attempt` (1-based) with the given budget. Plain I/O failures get a
    /// single retry regardless of the phase budget.
    pub fn should_retry(error: &PipelineError, attempt: u32, budget: u32) -> bool {
        let budget = match error {
            PipelineError::Io { .. } => budget.min(2),
            _ => budget,
        };
        error.is_retriable() && attempt < budget
    }

    /// Exponential backoff with up to 25% jitter.
    pub fn backoff_delay(attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = BASE_BACKOFF
            .saturating_mul(2u32.saturating_pow(exp))
            .min(MAX_BACKOFF);
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChunkRecord, ChunkStatus, PhaseStatus, PipelineState, SourceInfo};
    use crate::util::sha256_hex;
    use tempfile::tempdir;

    fn seeded_store(dir: &std::path::Path) -> (StateStore, PipelineState) {
        let store = StateStore::open(dir.join("pipeline.json")).unwrap();
        let state = PipelineState::new(
            "f1",
            SourceInfo {
                path: "b.epub".into(),
                hash: "h".into(),
                mime: "application/epub+zip".into(),
                size_bytes: 3,
            },
        );
        store.save(&state, None, "init").unwrap();
        (store, state)
    }

    #[test]
    fn test_fresh_for_untouched_phase() {
        let dir = tempdir().unwrap();
        let (store, _) = seeded_store(dir.path());
        let decision =
            RetryEngine::decide(&store, PhaseLabel::Synthesize, "in", None).unwrap();
        assert_eq!(decision, RunDecision::Fresh);
    }

    #[test]
    fn test_skip_when_reusable() {
        let dir = tempdir().unwrap();
        let (store, mut state) = seeded_store(dir.path());
        std::fs::write(dir.path().join("text.txt"), b"content").unwrap();
        let block = state.phase_mut(PhaseLabel::Extract);
        block.status = PhaseStatus::Success;
        block.inputs_hash = Some("in".into());
        block.artifacts.push(crate::state::ArtifactRef {
            path: "text.txt".into(),
            size_bytes: 7,
            hash: Some(sha256_hex(b"content")),
        });
        store.save(&state, None, "t").unwrap();

        let decision = RetryEngine::decide(&store, PhaseLabel::Extract, "in", None).unwrap();
        assert_eq!(decision, RunDecision::Skip);
    }

    #[test]
    fn test_no_resume_flag_forces_fresh() {
        let dir = tempdir().unwrap();
        let (store, mut state) = seeded_store(dir.path());
        std::fs::write(dir.path().join("text.txt"), b"content").unwrap();
        let block = state.phase_mut(PhaseLabel::Extract);
        block.status = PhaseStatus::Success;
        block.inputs_hash = Some("in".into());
        store.save(&state, None, "t").unwrap();

        let decision =
            RetryEngine::decide(&store, PhaseLabel::Extract, "in", Some(false)).unwrap();
        assert_eq!(decision, RunDecision::Fresh);
    }

    #[test]
    fn test_resume_for_partially_synthesized_phase() {
        let dir = tempdir().unwrap();
        let (store, mut state) = seeded_store(dir.path());
        let block = state.phase_mut(PhaseLabel::Synthesize);
        block.status = PhaseStatus::Failed;
        block.chunks.insert(
            0,
            ChunkRecord {
                status: ChunkStatus::Success,
                artifact_path: Some("c0.wav".into()),
                ..Default::default()
            },
        );
        block.chunks.insert(1, ChunkRecord::default());
        store.save(&state, None, "t").unwrap();

        let decision =
            RetryEngine::decide(&store, PhaseLabel::Synthesize, "in", None).unwrap();
        assert_eq!(decision, RunDecision::Resume);
    }

    #[test]
    fn test_unchunked_phase_never_resumes() {
        let dir = tempdir().unwrap();
        let (store, mut state) = seeded_store(dir.path());
        state.phase_mut(PhaseLabel::Master).status = PhaseStatus::Failed;
        store.save(&state, None, "t").unwrap();

        let decision = RetryEngine::decide(&store, PhaseLabel::Master, "in", None).unwrap();
        assert_eq!(decision, RunDecision::Fresh);
    }

    #[test]
    fn test_should_retry_respects_budget_and_kind() {
        let timeout = PipelineError::Timeout {
            phase: "phase4".into(),
            timeout_secs: 60,
        };
        assert!(RetryEngine::should_retry(&timeout, 1, 3));
        assert!(RetryEngine::should_retry(&timeout, 2, 3));
        assert!(!RetryEngine::should_retry(&timeout, 3, 3));

        let invalid = PipelineError::InvalidPatch {
            phase: "phase4".into(),
            reason: "r".into(),
        };
        assert!(!RetryEngine::should_retry(&invalid, 1, 3));
    }

    #[test]
    fn test_io_errors_retry_once_only() {
        let io = PipelineError::Io {
            path: std::path::PathBuf::from("x"),
            source: std::io::Error::other("disk"),
        };
        assert!(RetryEngine::should_retry(&io, 1, 5));
        assert!(!RetryEngine::should_retry(&io, 2, 5));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let first = RetryEngine::backoff_delay(1);
        assert!(first >= Duration::from_secs(5));
        assert!(first <= Duration::from_secs(7));

        let tenth = RetryEngine::backoff_delay(10);
        assert!(tenth >= Duration::from_secs(300));
        assert!(tenth <= Duration::from_secs(375));
    }

}
