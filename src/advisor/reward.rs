//! Scalar reward per run.
//!
//! The reward folds run success, duration against the rolling baseline,
//! chunk failures, and repair effectiveness into one number in [-1, 1].
//! Rolling statistics of rewards drive the self-driving adjustments.

/// Relative weights of the reward terms.
const WEIGHT_SUCCESS: f64 = 0.5;
const WEIGHT_DURATION: f64 = 0.2;
const WEIGHT_CHUNK_FAILURES: f64 = 0.2;
const WEIGHT_REPAIRS: f64 = 0.1;

/// Facts about one finished run, gathered by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct RunFacts {
    pub success: bool,
    pub duration_ms: u64,
    /// Mean duration of recent comparable runs; `None` on the first runs.
    pub baseline_duration_ms: Option<f64>,
    /// Failed chunks over total chunks, 0 when nothing was chunked.
    pub chunk_failure_rate: f64,
    /// Repaired chunks over failed chunks, 0 when nothing failed.
    pub repair_success_rate: f64,
}

/// Compute the run reward.
///
/// Success contributes +/- its weight outright. Duration contributes
/// positively when the run beat the baseline and negatively when it was
/// slower, saturating at twice the baseline. Chunk failures and repairs
/// contribute linearly.
pub fn compute_reward(facts: &RunFacts) -> f64 {
    let success_term = if facts.success { 1.0 } else { -1.0 };

    let duration_term = match facts.baseline_duration_ms {
        Some(baseline) if baseline > 0.0 => {
            let ratio = facts.duration_ms as f64 / baseline;
            // 1.0 at half the baseline, 0 at parity, -1.0 at double.
            (1.0 - ratio).clamp(-1.0, 1.0)
        }
        _ => 0.0,
    };

    let chunk_term = -facts.chunk_failure_rate.clamp(0.0, 1.0);
    let repair_term = facts.repair_success_rate.clamp(0.0, 1.0);

    (WEIGHT_SUCCESS * success_term
        + WEIGHT_DURATION * duration_term
        + WEIGHT_CHUNK_FAILURES * chunk_term
        + WEIGHT_REPAIRS * repair_term)
        .clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_fast_run_scores_high() {
        let facts = RunFacts {
            success: true,
            duration_ms: 500,
            baseline_duration_ms: Some(1000.0),
            chunk_failure_rate: 0.0,
            repair_success_rate: 0.0,
        };
        let reward = compute_reward(&facts);
        assert!(reward > 0.55, "reward was {}", reward);
    }

    #[test]
    fn test_failed_run_scores_negative() {
        let facts = RunFacts {
            success: false,
            duration_ms: 1000,
            baseline_duration_ms: Some(1000.0),
            chunk_failure_rate: 0.3,
            repair_success_rate: 0.0,
        };
        assert!(compute_reward(&facts) < 0.0);
    }

    #[test]
    fn test_repairs_soften_chunk_failures() {
        let without_repairs = RunFacts {
            success: true,
            duration_ms: 1000,
            baseline_duration_ms: Some(1000.0),
            chunk_failure_rate: 0.2,
            repair_success_rate: 0.0,
        };
        let with_repairs = RunFacts {
            repair_success_rate: 1.0,
            ..without_repairs.clone()
        };
        assert!(compute_reward(&with_repairs) > compute_reward(&without_repairs));
    }

    #[test]
    fn test_no_baseline_is_duration_neutral() {
        let facts = RunFacts {
            success: true,
            duration_ms: 99999,
            baseline_duration_ms: None,
            ..Default::default()
        };
        assert!((compute_reward(&facts) - WEIGHT_SUCCESS).abs() < 1e-9);
    }

    #[test]
    fn test_reward_is_bounded() {
        let worst = RunFacts {
            success: false,
            duration_ms: 10_000,
            baseline_duration_ms: Some(100.0),
            chunk_failure_rate: 1.0,
            repair_success_rate: 0.0,
        };
        let reward = compute_reward(&worst);
        assert!((-1.0..=1.0).contains(&reward));
    }
}
