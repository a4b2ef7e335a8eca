//! Rolling-window aggregation over the telemetry log.
//!
//! The advisor never reads the state document; its entire world is the
//! append-only telemetry stream, folded here into per-phase and per-engine
//! statistics.

use std::collections::BTreeMap;

use crate::phase::PhaseLabel;
use crate::telemetry::{TelemetryEvent, TelemetryRecord};

/// Aggregates for one phase across the window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseWindowStats {
    /// Completed attempts (`phase_end` events).
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    pub retries: usize,
    pub timeouts: usize,
    pub avg_duration_ms: f64,
    /// Mean of the `chunk_failure_rate` metric across completions that
    /// reported it.
    pub chunk_failure_rate: f64,
}

impl PhaseWindowStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }
}

/// Success statistics for one engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub attempts: usize,
    pub successes: usize,
}

impl EngineStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// The folded window handed to the advisor.
#[derive(Debug, Clone, Default)]
pub struct TelemetryWindow {
    pub phases: BTreeMap<PhaseLabel, PhaseWindowStats>,
    pub engines: BTreeMap<String, EngineStats>,
    /// Terminal run outcomes in the window (`run_end` events).
    pub runs: usize,
    pub successful_runs: usize,
    /// Rewards reported at run end, oldest first.
    pub rewards: Vec<f64>,
}

impl TelemetryWindow {
    pub fn from_records(records: &[TelemetryRecord]) -> Self {
        let mut window = TelemetryWindow::default();
        let mut durations: BTreeMap<PhaseLabel, (f64, usize)> = BTreeMap::new();
        let mut chunk_rates: BTreeMap<PhaseLabel, (f64, usize)> = BTreeMap::new();

        for record in records {
            match record.event {
                TelemetryEvent::PhaseEnd => {
                    let Some(phase) = record.phase else { continue };
                    let stats = window.phases.entry(phase).or_default();
                    stats.attempts += 1;
                    let success = record.status.as_deref() == Some("success")
                        || record.status.as_deref() == Some("reused");
                    if success {
                        stats.successes += 1;
                    } else {
                        stats.failures += 1;
                    }
                    if record.status.as_deref() == Some("timeout") {
                        stats.timeouts += 1;
                    }
                    if let Some(ms) = record.duration_ms {
                        let (sum, count) = durations.entry(phase).or_default();
                        *sum += ms as f64;
                        *count += 1;
                    }
                    if let Some(rate) = record.metrics.get("chunk_failure_rate") {
                        let (sum, count) = chunk_rates.entry(phase).or_default();
                        *sum += rate;
                        *count += 1;
                    }
                    if let Some(engine) = &record.engine {
                        let stats = window.engines.entry(engine.clone()).or_default();
                        stats.attempts += 1;
                        if success {
                            stats.successes += 1;
                        }
                    }
                }
                TelemetryEvent::PhaseRetry => {
                    if let Some(phase) = record.phase {
                        window.phases.entry(phase).or_default().retries += 1;
                    }
                }
                TelemetryEvent::RunEnd => {
                    window.runs += 1;
                    if record.status.as_deref() == Some("success") {
                        window.successful_runs += 1;
                    }
                    if let Some(reward) = record.metrics.get("reward") {
                        window.rewards.push(*reward);
                    }
                }
                _ => {}
            }
        }

        for (phase, (sum, count)) in durations {
            if count > 0 {
                window.phases.entry(phase).or_default().avg_duration_ms = sum / count as f64;
            }
        }
        for (phase, (sum, count)) in chunk_rates {
            if count > 0 {
                window.phases.entry(phase).or_default().chunk_failure_rate = sum / count as f64;
            }
        }
        window
    }

    pub fn phase(&self, label: PhaseLabel) -> Option<&PhaseWindowStats> {
        self.phases.get(&label)
    }

    /// Rolling failure rate across all phase completions.
    pub fn overall_failure_rate(&self) -> f64 {
        let attempts: usize = self.phases.values().map(|s| s.attempts).sum();
        let failures: usize = self.phases.values().map(|s| s.failures).sum();
        if attempts == 0 {
            0.0
        } else {
            failures as f64 / attempts as f64
        }
    }

    /// The engine with the best success rate among those with at least
    /// `min_attempts` completions.
    pub fn best_engine(&self, min_attempts: usize) -> Option<(&str, &EngineStats)> {
        self.engines
            .iter()
            .filter(|(_, stats)| stats.attempts >= min_attempts)
            .max_by(|a, b| {
                a.1.success_rate()
                    .partial_cmp(&b.1.success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, stats)| (name.as_str(), stats))
    }

    /// Mean of the most recent `n` rewards.
    pub fn rolling_reward(&self, n: usize) -> Option<f64> {
        if self.rewards.is_empty() {
            return None;
        }
        let tail = &self.rewards[self.rewards.len().saturating_sub(n)..];
        Some(tail.iter().sum::<f64>() / tail.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end_record(
        phase: PhaseLabel,
        status: &str,
        engine: Option<&str>,
        duration_ms: u64,
    ) -> TelemetryRecord {
        let mut record = TelemetryRecord::new("f1", TelemetryEvent::PhaseEnd)
            .with_phase(phase)
            .with_status(status)
            .with_duration_ms(duration_ms);
        record.engine = engine.map(str::to_string);
        record
    }

    #[test]
    fn test_phase_aggregation() {
        let records = vec![
            end_record(PhaseLabel::Synthesize, "success", Some("styletts2"), 1000),
            end_record(PhaseLabel::Synthesize, "failed", Some("styletts2"), 3000),
            end_record(PhaseLabel::Synthesize, "success", Some("kokoro"), 2000),
            TelemetryRecord::new("f1", TelemetryEvent::PhaseRetry)
                .with_phase(PhaseLabel::Synthesize),
        ];
        let window = TelemetryWindow::from_records(&records);
        let stats = window.phase(PhaseLabel::Synthesize).unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.retries, 1);
        assert!((stats.avg_duration_ms - 2000.0).abs() < 1e-9);
        assert!((stats.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_engine_stats_and_best_engine() {
        let records = vec![
            end_record(PhaseLabel::Synthesize, "failed", Some("styletts2"), 100),
            end_record(PhaseLabel::Synthesize, "failed", Some("styletts2"), 100),
            end_record(PhaseLabel::Synthesize, "success", Some("styletts2"), 100),
            end_record(PhaseLabel::Synthesize, "success", Some("kokoro"), 100),
            end_record(PhaseLabel::Synthesize, "success", Some("kokoro"), 100),
            end_record(PhaseLabel::Synthesize, "success", Some("kokoro"), 100),
        ];
        let window = TelemetryWindow::from_records(&records);
        assert_eq!(window.engines["styletts2"].attempts, 3);
        assert_eq!(window.engines["kokoro"].successes, 3);

        let (best, stats) = window.best_engine(3).unwrap();
        assert_eq!(best, "kokoro");
        assert!((stats.success_rate() - 1.0).abs() < 1e-9);
        // Sample-size floor filters thin engines out.
        assert!(window.best_engine(4).is_none());
    }

    #[test]
    fn test_run_counting_and_rewards() {
        let mut run_ok = TelemetryRecord::new("f1", TelemetryEvent::RunEnd).with_status("success");
        run_ok.metrics.insert("reward".into(), 0.8);
        let mut run_bad = TelemetryRecord::new("f1", TelemetryEvent::RunEnd).with_status("failed");
        run_bad.metrics.insert("reward".into(), -0.4);

        let window = TelemetryWindow::from_records(&[run_ok, run_bad]);
        assert_eq!(window.runs, 2);
        assert_eq!(window.successful_runs, 1);
        assert!((window.rolling_reward(10).unwrap() - 0.2).abs() < 1e-9);
        assert!((window.rolling_reward(1).unwrap() - (-0.4)).abs() < 1e-9);
    }

    #[test]
    fn test_chunk_failure_rate_mean() {
        let mut a = end_record(PhaseLabel::Synthesize, "failed", None, 100);
        a.metrics.insert("chunk_failure_rate".into(), 0.2);
        let mut b = end_record(PhaseLabel::Synthesize, "success", None, 100);
        b.metrics.insert("chunk_failure_rate".into(), 0.0);

        let window = TelemetryWindow::from_records(&[a, b]);
        let stats = window.phase(PhaseLabel::Synthesize).unwrap();
        assert!((stats.chunk_failure_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_reused_counts_as_success() {
        let records = vec![end_record(PhaseLabel::Extract, "reused", None, 10)];
        let window = TelemetryWindow::from_records(&records);
        assert_eq!(window.phase(PhaseLabel::Extract).unwrap().successes, 1);
        assert!((window.overall_failure_rate() - 0.0).abs() < 1e-9);
    }
}
