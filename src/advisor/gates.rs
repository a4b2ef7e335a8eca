//! Safety gates in front of override application.
//!
//! A recommendation only becomes an override in `supervised`/`autonomous`
//! mode after every gate passes. A blocked recommendation is journaled and
//! the run continues on baseline parameters; the gate never fails the run.

use serde_json::Value;

use crate::advisor::stats::TelemetryWindow;
use crate::pipeline_config::AdvisorSection;

/// Outcome of the gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    /// Blocked, with the name of the first failing gate.
    Blocked(&'static str),
}

impl GateVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }

    pub fn gate_name(&self) -> Option<&'static str> {
        match self {
            GateVerdict::Pass => None,
            GateVerdict::Blocked(name) => Some(name),
        }
    }
}

/// Relative delta of a proposed numeric value against its baseline.
/// `None` for non-numeric parameters (an engine swap has no meaningful
/// numeric drift).
pub fn relative_delta(baseline: &Value, proposed: &Value) -> Option<f64> {
    let baseline = baseline.as_f64()?;
    let proposed = proposed.as_f64()?;
    if baseline == 0.0 {
        return None;
    }
    Some(((proposed - baseline) / baseline).abs())
}

/// Check every gate for one proposed override.
///
/// `cumulative_drift` is the sum of relative deltas already applied to this
/// parameter across the window, read from the policy journal.
pub fn check_gates(
    config: &AdvisorSection,
    window: &TelemetryWindow,
    baseline: Option<&Value>,
    proposed: &Value,
    cumulative_drift: f64,
) -> GateVerdict {
    // Readiness: enough recent successful runs to trust the statistics.
    if window.successful_runs < config.readiness_min_runs {
        return GateVerdict::Blocked("readiness");
    }

    // Stability: do not tune a pipeline that is currently on fire.
    if window.overall_failure_rate() >= config.failure_rate_threshold {
        return GateVerdict::Blocked("stability");
    }

    // Drift bound on the single proposal.
    let delta = baseline.and_then(|b| relative_delta(b, proposed));
    if let Some(delta) = delta
        && delta > config.drift_bound
    {
        return GateVerdict::Blocked("drift_bound");
    }

    // Budget on cumulative drift across the window.
    if let Some(delta) = delta
        && cumulative_drift + delta > config.drift_budget
    {
        return GateVerdict::Blocked("drift_budget");
    }

    GateVerdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseLabel;
    use crate::telemetry::{TelemetryEvent, TelemetryRecord};
    use serde_json::json;

    fn healthy_window(successful_runs: usize) -> TelemetryWindow {
        let mut records = Vec::new();
        for _ in 0..successful_runs {
            records.push(
                TelemetryRecord::new("f1", TelemetryEvent::RunEnd).with_status("success"),
            );
            records.push(
                TelemetryRecord::new("f1", TelemetryEvent::PhaseEnd)
                    .with_phase(PhaseLabel::Synthesize)
                    .with_status("success")
                    .with_duration_ms(100),
            );
        }
        TelemetryWindow::from_records(&records)
    }

    #[test]
    fn test_readiness_blocks_thin_history() {
        let config = AdvisorSection::default();
        let window = healthy_window(2);
        let verdict = check_gates(&config, &window, Some(&json!(2000)), &json!(1700), 0.0);
        assert_eq!(verdict, GateVerdict::Blocked("readiness"));
    }

    #[test]
    fn test_stability_blocks_failing_pipeline() {
        let config = AdvisorSection::default();
        let mut records = Vec::new();
        for _ in 0..5 {
            records.push(
                TelemetryRecord::new("f1", TelemetryEvent::RunEnd).with_status("success"),
            );
        }
        for status in ["failed", "failed", "success"] {
            records.push(
                TelemetryRecord::new("f1", TelemetryEvent::PhaseEnd)
                    .with_phase(PhaseLabel::Synthesize)
                    .with_status(status),
            );
        }
        let window = TelemetryWindow::from_records(&records);
        let verdict = check_gates(&config, &window, Some(&json!(2000)), &json!(1900), 0.0);
        assert_eq!(verdict, GateVerdict::Blocked("stability"));
    }

    #[test]
    fn test_drift_bound_blocks_large_delta() {
        let config = AdvisorSection::default();
        let window = healthy_window(6);
        // -40% exceeds the 25% bound.
        let verdict = check_gates(&config, &window, Some(&json!(2000)), &json!(1200), 0.0);
        assert_eq!(verdict, GateVerdict::Blocked("drift_bound"));
    }

    #[test]
    fn test_drift_budget_blocks_cumulative_creep() {
        let config = AdvisorSection::default();
        let window = healthy_window(6);
        // 15% now, but 40% already spent against a 50% budget.
        let verdict = check_gates(&config, &window, Some(&json!(2000)), &json!(1700), 0.40);
        assert_eq!(verdict, GateVerdict::Blocked("drift_budget"));
    }

    #[test]
    fn test_all_gates_pass() {
        let config = AdvisorSection::default();
        let window = healthy_window(6);
        let verdict = check_gates(&config, &window, Some(&json!(2000)), &json!(1700), 0.1);
        assert!(verdict.is_pass());
    }

    #[test]
    fn test_non_numeric_proposal_skips_drift_gates() {
        let config = AdvisorSection::default();
        let window = healthy_window(6);
        let verdict = check_gates(
            &config,
            &window,
            Some(&json!("styletts2")),
            &json!("kokoro"),
            10.0,
        );
        assert!(verdict.is_pass());
    }

    #[test]
    fn test_relative_delta() {
        assert_eq!(relative_delta(&json!(2000), &json!(1500)), Some(0.25));
        assert_eq!(relative_delta(&json!("a"), &json!("b")), None);
        assert_eq!(relative_delta(&json!(0), &json!(5)), None);
    }
}
