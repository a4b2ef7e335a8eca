//! Run summary, status, and advisor report rendering.

use console::style;

use crate::advisor::{PolicyJournalEntry, TelemetryWindow};
use crate::orchestrator::{RunOutcome, RunReport};
use crate::phase::PhaseLabel;
use crate::state::PipelineState;
use crate::util::truncate_str;

/// Print the structured run summary to stdout.
pub fn display_run_summary(report: &RunReport) {
    println!();
    match &report.outcome {
        RunOutcome::Success => {
            println!("{} run {}", style("Completed").green().bold(), report.run_id);
        }
        RunOutcome::Cancelled => {
            println!("{} run {}", style("Cancelled").yellow().bold(), report.run_id);
        }
        RunOutcome::Failed { kind, message } => {
            println!("{} run {}", style("Failed").red().bold(), report.run_id);
            println!("  {}: {}", style(kind).red(), message);
        }
    }
    println!(
        "  book {}  |  {:.1}s  |  reward {:+.2}",
        report.file_id,
        report.duration_ms as f64 / 1000.0,
        report.reward
    );
    println!("  logs: {}", report.log_pointer.display());
    println!();

    println!(
        "  {:<12} {:<10} {:<10} {:<9} {:<18}",
        "Phase", "Status", "Duration", "Attempts", "Chunks"
    );
    println!(
        "  {:<12} {:<10} {:<10} {:<9} {:<18}",
        "------------", "----------", "----------", "---------", "------------------"
    );
    for phase in &report.phases {
        let chunks = if phase.chunks_total > 0 {
            let mut cell = format!(
                "{}/{}",
                phase.chunks_total - phase.chunks_failed,
                phase.chunks_total
            );
            if phase.chunks_repaired > 0 {
                cell.push_str(&format!(" ({} repaired)", phase.chunks_repaired));
            }
            cell
        } else {
            "-".to_string()
        };
        println!(
            "  {:<12} {:<10} {:<10} {:<9} {:<18}",
            phase.label.name(),
            format!("{:?}", phase.status).to_lowercase(),
            format_duration_ms(phase.duration_ms),
            phase.attempts,
            chunks
        );
    }

    if !report.applied_overrides.is_empty() {
        println!();
        println!("  {}", style("Applied overrides").bold());
        for entry in &report.applied_overrides {
            println!(
                "    {}.{} = {}  [{:?}]",
                entry.target_phase,
                entry.parameter,
                entry.value,
                entry.source
            );
        }
    }

    if !report.recommendations.is_empty() {
        println!();
        println!("  {}", style("Advisor recommendations").bold());
        for recommendation in &report.recommendations {
            println!(
                "    {}.{} -> {}  ({:.0}% confidence): {}",
                recommendation.phase,
                recommendation.parameter,
                recommendation.proposed,
                recommendation.confidence * 100.0,
                truncate_str(&recommendation.rationale, 60)
            );
        }
    }

    if !report.repairs.is_empty() {
        println!();
        println!("  {}", style("Repairs").bold());
        for manifest in &report.repairs {
            println!(
                "    chunk {} via {} (confidence {:.2}){}",
                manifest.chunk_id,
                manifest.strategy,
                manifest.confidence,
                if manifest.applied { "" } else { " [not applied]" }
            );
        }
    }
    println!();
}

/// Print per-phase progress from a state document (the `status` command;
/// read-only, no lock taken).
pub fn display_status(state: &PipelineState) {
    println!();
    println!(
        "book {}  ({}, {} bytes)",
        state.file_id, state.source.mime, state.source.size_bytes
    );
    println!("source: {}", state.source.path);
    if let Some(phase) = state.runtime.current_phase {
        println!("in flight: {} (pid {:?})", phase, state.runtime.pid);
    }
    println!();
    println!(
        "{:<12} {:<10} {:<10} {:<9} {:<14}",
        "Phase", "Status", "Duration", "Attempts", "Chunks"
    );
    println!(
        "{:<12} {:<10} {:<10} {:<9} {:<14}",
        "------------", "----------", "----------", "---------", "--------------"
    );
    for label in PhaseLabel::all() {
        let Some(block) = state.phase(*label) else {
            println!(
                "{:<12} {:<10} {:<10} {:<9} {:<14}",
                label.name(),
                "pending",
                "-",
                0,
                "-"
            );
            continue;
        };
        let chunks = if block.chunk_total() > 0 {
            format!("{}/{}", block.chunks_usable(), block.chunk_total())
        } else {
            "-".to_string()
        };
        println!(
            "{:<12} {:<10} {:<10} {:<9} {:<14}",
            label.name(),
            format!("{:?}", block.status).to_lowercase(),
            format_duration_ms(block.duration_ms.unwrap_or(0)),
            block.attempt,
            chunks
        );
    }
    if let Some(error) = &state.runtime.last_error {
        println!();
        println!("last error [{}]: {}", error.kind, error.message);
    }
    println!();
}

/// Print the rolling window statistics and recent journal entries (the
/// `advisor report` command).
pub fn display_advisor_report(
    window: &TelemetryWindow,
    journal: &[PolicyJournalEntry],
    days: usize,
) {
    println!();
    println!(
        "{} (last {} days: {} runs, {} successful)",
        style("Advisor window").bold(),
        days,
        window.runs,
        window.successful_runs
    );
    println!(
        "overall failure rate: {:.0}%",
        window.overall_failure_rate() * 100.0
    );
    if let Some(reward) = window.rolling_reward(10) {
        println!("rolling reward (10): {:+.2}", reward);
    }

    if !window.phases.is_empty() {
        println!();
        println!(
            "{:<12} {:<9} {:<9} {:<9} {:<12} {:<10}",
            "Phase", "Attempts", "Success", "Retries", "AvgDuration", "ChunkFail"
        );
        for (label, stats) in &window.phases {
            println!(
                "{:<12} {:<9} {:<9} {:<9} {:<12} {:<10}",
                label.name(),
                stats.attempts,
                stats.successes,
                stats.retries,
                format_duration_ms(stats.avg_duration_ms as u64),
                format!("{:.0}%", stats.chunk_failure_rate * 100.0)
            );
        }
    }

    if !window.engines.is_empty() {
        println!();
        println!("{:<12} {:<9} {:<9}", "Engine", "Attempts", "Success");
        for (engine, stats) in &window.engines {
            println!(
                "{:<12} {:<9} {:<9}",
                engine,
                stats.attempts,
                format!("{:.0}%", stats.success_rate() * 100.0)
            );
        }
    }

    let recent: Vec<&PolicyJournalEntry> = journal
        .iter()
        .filter(|e| e.outcome != "reward")
        .rev()
        .take(10)
        .collect();
    if !recent.is_empty() {
        println!();
        println!("{}", style("Recent policy decisions").bold());
        for entry in recent.into_iter().rev() {
            println!(
                "  {} {} {}.{} -> {}",
                entry.timestamp.format("%m-%d %H:%M"),
                entry.outcome,
                entry
                    .phase
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
                entry.parameter.as_deref().unwrap_or("-"),
                entry
                    .proposed
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".into())
            );
        }
    }
    println!();
}

fn format_duration_ms(ms: u64) -> String {
    if ms == 0 {
        "-".to_string()
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}
