//! Post-run chunk repair.
//!
//! Disabled by default; when enabled (`[repair] enabled = true` or the
//! `repair` subcommand) the loop walks the failure registry, tries the
//! strategies in order for each still-failed chunk, and substitutes
//! accepted replacements by reference. Originals are never deleted; a
//! manifest per chunk records what happened either way.

pub mod registry;
pub mod strategies;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{info, warn};

pub use registry::{FailureRegistry, RegistryEntry, RegistryMap};
pub use strategies::{
    RepairManifest, RepairStrategy, concat_wav, confidence_score, read_wav, simplify_text,
    split_at_boundaries,
};

use crate::config::Config;
use crate::errors::PipelineError;
use crate::phase::PhaseLabel;
use crate::runner::{PhaseInvocation, PhaseRunner};
use crate::state::{ChunkStatus, StateStore};
use crate::telemetry::{TelemetryEvent, TelemetryRecord, TelemetrySink};

/// Validation RMS at or above this level counts as fully plausible speech.
const SPEECH_RMS_FLOOR: f64 = 0.02;

/// Everything the loop needs, threaded in by the orchestrator.
pub struct RepairContext<'a> {
    pub config: &'a Config,
    pub store: &'a StateStore,
    pub registry: &'a FailureRegistry,
    pub telemetry: &'a TelemetrySink,
    pub runner: &'a PhaseRunner,
}

/// Where the segmenter leaves the text of one chunk.
pub fn chunk_text_path(workdir: &Path, chunk_id: u32) -> PathBuf {
    workdir
        .join("segment")
        .join("chunks")
        .join(format!("chunk-{}.txt", chunk_id))
}

/// Run the repair loop for every registered, still-failed synthesis chunk.
/// Returns the manifests written (applied or not).
pub async fn run_repair_loop(
    ctx: &RepairContext<'_>,
    file_id: &str,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<RepairManifest>, PipelineError> {
    let phase = PhaseLabel::Synthesize;
    let state = ctx.store.read()?;
    let registered = ctx.registry.failed_chunks(file_id, phase)?;

    // Only chunks the state document still marks failed need work; repairs
    // from earlier loops stay settled.
    let pending: Vec<u32> = registered
        .into_iter()
        .filter(|id| {
            state
                .phase(phase)
                .and_then(|b| b.chunks.get(id))
                .map(|c| c.status == ChunkStatus::Failed)
                .unwrap_or(false)
        })
        .collect();

    if pending.is_empty() {
        info!("repair loop: nothing to repair");
        return Ok(Vec::new());
    }
    info!(chunks = pending.len(), "repair loop starting");

    let mut manifests = Vec::new();
    for chunk_id in pending {
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(PipelineError::Cancelled {
                phase: phase.to_string(),
            });
        }
        match repair_chunk(ctx, file_id, phase, chunk_id, &cancel).await? {
            Some(manifest) => manifests.push(manifest),
            None => {
                warn!(chunk_id, "no repair strategy produced an acceptable artifact");
            }
        }
    }
    Ok(manifests)
}

/// Try strategies in order for one chunk; stop at the first accepted
/// candidate. Returns the manifest of the accepted repair, if any.
async fn repair_chunk(
    ctx: &RepairContext<'_>,
    file_id: &str,
    phase: PhaseLabel,
    chunk_id: u32,
    cancel: &Arc<AtomicBool>,
) -> Result<Option<RepairManifest>, PipelineError> {
    let repair_dir = ctx.store.meta_dir().join("repairs").join(phase.as_str());
    std::fs::create_dir_all(&repair_dir).map_err(|source| PipelineError::Io {
        path: repair_dir.clone(),
        source,
    })?;

    let text_path = chunk_text_path(&ctx.config.workdir, chunk_id);
    let text = std::fs::read_to_string(&text_path).ok();

    for strategy in RepairStrategy::ordered(&ctx.config.toml.repair) {
        // Text-driven strategies need the chunk text.
        if text.is_none() && strategy != RepairStrategy::EngineSwitch {
            continue;
        }
        ctx.telemetry.append(
            TelemetryRecord::new(file_id, TelemetryEvent::RepairAttempt)
                .with_phase(phase)
                .with_detail(format!("chunk {} via {}", chunk_id, strategy)),
        )?;

        let candidate = repair_dir.join(format!("{}.wav", chunk_id));
        let produced = match strategy {
            RepairStrategy::SubSplit => {
                sub_split_candidate(
                    ctx,
                    file_id,
                    phase,
                    chunk_id,
                    text.as_deref().unwrap_or_default(),
                    &repair_dir,
                    &candidate,
                    cancel,
                )
                .await
            }
            RepairStrategy::EngineSwitch => {
                engine_switch_candidate(ctx, file_id, phase, chunk_id, &candidate, cancel).await
            }
            RepairStrategy::TextRewrite => {
                rewrite_candidate(
                    ctx,
                    file_id,
                    phase,
                    chunk_id,
                    text.as_deref().unwrap_or_default(),
                    &repair_dir,
                    &candidate,
                    cancel,
                )
                .await
            }
            RepairStrategy::Simplify => {
                simplify_candidate(
                    ctx,
                    file_id,
                    phase,
                    chunk_id,
                    text.as_deref().unwrap_or_default(),
                    &repair_dir,
                    &candidate,
                    cancel,
                )
                .await
            }
        };

        let produced = match produced {
            Ok(produced) => produced,
            Err(PipelineError::Cancelled { phase }) => {
                return Err(PipelineError::Cancelled { phase });
            }
            Err(e) => {
                warn!(chunk_id, strategy = %strategy, error = %e, "repair strategy errored");
                false
            }
        };
        if !produced {
            continue;
        }

        let confidence = score_candidate(ctx, phase, chunk_id, text.as_deref(), &candidate)?;
        let threshold = ctx.config.toml.repair.confidence_threshold;
        let applied = confidence >= threshold;

        let original_artifact = ctx
            .store
            .read()?
            .phase(phase)
            .and_then(|b| b.chunks.get(&chunk_id))
            .and_then(|c| c.artifact_path.clone());
        let replacement_rel = candidate
            .strip_prefix(&ctx.config.workdir)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| candidate.display().to_string());

        let manifest = RepairManifest {
            file_id: file_id.to_string(),
            phase,
            chunk_id,
            strategy,
            original_artifact,
            replacement_artifact: replacement_rel.clone(),
            confidence,
            applied,
            created_at: chrono::Utc::now(),
        };
        manifest.save(ctx.store.meta_dir())?;

        if !applied {
            info!(
                chunk_id,
                strategy = %strategy,
                confidence,
                threshold,
                "candidate below confidence threshold"
            );
            continue;
        }

        // Substitute by reference under the write lock; the original
        // artifact and the registry entry are both retained.
        ctx.store.with_write_lock(|store| {
            store.update(Some(phase), "chunk_repaired", |state| {
                let chunk = state.phase_mut(phase).chunks.entry(chunk_id).or_default();
                chunk.status = ChunkStatus::Repaired;
                chunk.repaired_artifact_path = Some(replacement_rel.clone());
            })?;
            Ok(())
        })?;
        ctx.telemetry.append(
            TelemetryRecord::new(file_id, TelemetryEvent::RepairApplied)
                .with_phase(phase)
                .with_metric("confidence", confidence)
                .with_detail(format!("chunk {} via {}", chunk_id, strategy)),
        )?;
        info!(chunk_id, strategy = %strategy, confidence, "repair applied");
        return Ok(Some(manifest));
    }
    Ok(None)
}

/// Invoke the synthesis command for one repair candidate.
async fn invoke_phase_for_chunk(
    ctx: &RepairContext<'_>,
    file_id: &str,
    phase: PhaseLabel,
    chunk_id: u32,
    parameters: Vec<(String, String)>,
    input_override: Option<PathBuf>,
    output: &Path,
    cancel: &Arc<AtomicBool>,
) -> Result<bool, PipelineError> {
    let inv = PhaseInvocation {
        label: phase,
        command: ctx.config.toml.phase_command(phase),
        file_id: file_id.to_string(),
        state_path: ctx.config.state_path.clone(),
        workdir: ctx.config.workdir.clone(),
        resume: false,
        attempt: 1,
        timeout: Duration::from_secs(ctx.config.timeout_secs(phase).min(3600)),
        parameters,
        env: ctx.config.toml.phase_section(phase).env.into_iter().collect(),
        chunk_id: Some(chunk_id),
        input_override,
        output_override: Some(output.to_path_buf()),
    };
    let report = ctx.runner.run(&inv, Arc::clone(cancel)).await?;
    if report.cancelled {
        return Err(PipelineError::Cancelled {
            phase: phase.to_string(),
        });
    }
    Ok(report.exit_code == 0
        && output
            .metadata()
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false))
}

#[allow(clippy::too_many_arguments)]
async fn sub_split_candidate(
    ctx: &RepairContext<'_>,
    file_id: &str,
    phase: PhaseLabel,
    chunk_id: u32,
    text: &str,
    repair_dir: &Path,
    candidate: &Path,
    cancel: &Arc<AtomicBool>,
) -> Result<bool, PipelineError> {
    let parts = split_at_boundaries(text, ctx.config.toml.repair.max_sub_splits);
    if parts.len() < 2 {
        return Ok(false);
    }

    let mut outputs = Vec::with_capacity(parts.len());
    for (index, part) in parts.iter().enumerate() {
        let part_text = repair_dir.join(format!("{}-part-{}.txt", chunk_id, index));
        std::fs::write(&part_text, part).map_err(|source| PipelineError::Io {
            path: part_text.clone(),
            source,
        })?;
        let part_wav = repair_dir.join(format!("{}-part-{}.wav", chunk_id, index));
        let ok = invoke_phase_for_chunk(
            ctx,
            file_id,
            phase,
            chunk_id,
            Vec::new(),
            Some(part_text),
            &part_wav,
            cancel,
        )
        .await?;
        if !ok {
            return Ok(false);
        }
        outputs.push(part_wav);
    }
    concat_wav(&outputs, ctx.config.toml.repair.silence_ms, candidate)?;
    Ok(true)
}

async fn engine_switch_candidate(
    ctx: &RepairContext<'_>,
    file_id: &str,
    phase: PhaseLabel,
    chunk_id: u32,
    candidate: &Path,
    cancel: &Arc<AtomicBool>,
) -> Result<bool, PipelineError> {
    let baseline = &ctx.config.toml.defaults.engine;
    for engine in &ctx.config.toml.repair.fallback_engines {
        if engine == baseline {
            continue;
        }
        let ok = invoke_phase_for_chunk(
            ctx,
            file_id,
            phase,
            chunk_id,
            vec![("engine".to_string(), engine.clone())],
            None,
            candidate,
            cancel,
        )
        .await?;
        if ok {
            return Ok(true);
        }
    }
    Ok(false)
}

#[allow(clippy::too_many_arguments)]
async fn rewrite_candidate(
    ctx: &RepairContext<'_>,
    file_id: &str,
    phase: PhaseLabel,
    chunk_id: u32,
    text: &str,
    repair_dir: &Path,
    candidate: &Path,
    cancel: &Arc<AtomicBool>,
) -> Result<bool, PipelineError> {
    let Some(rewrite_command) = &ctx.config.toml.repair.rewrite_command else {
        return Ok(false);
    };

    use tokio::io::AsyncWriteExt;
    let mut child = tokio::process::Command::new(rewrite_command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|source| PipelineError::Io {
            path: PathBuf::from(rewrite_command),
            source,
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(text.as_bytes()).await;
    }
    let output = tokio::time::timeout(Duration::from_secs(120), child.wait_with_output())
        .await
        .map_err(|_| PipelineError::Timeout {
            phase: phase.to_string(),
            timeout_secs: 120,
        })?
        .map_err(|source| PipelineError::Io {
            path: PathBuf::from(rewrite_command),
            source,
        })?;
    if !output.status.success() || output.stdout.is_empty() {
        return Ok(false);
    }

    let rewritten_path = repair_dir.join(format!("{}-rewritten.txt", chunk_id));
    std::fs::write(&rewritten_path, &output.stdout).map_err(|source| PipelineError::Io {
        path: rewritten_path.clone(),
        source,
    })?;
    invoke_phase_for_chunk(
        ctx,
        file_id,
        phase,
        chunk_id,
        Vec::new(),
        Some(rewritten_path),
        candidate,
        cancel,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn simplify_candidate(
    ctx: &RepairContext<'_>,
    file_id: &str,
    phase: PhaseLabel,
    chunk_id: u32,
    text: &str,
    repair_dir: &Path,
    candidate: &Path,
    cancel: &Arc<AtomicBool>,
) -> Result<bool, PipelineError> {
    let simplified = simplify_text(text);
    if simplified.is_empty() || simplified == text {
        return Ok(false);
    }
    let simplified_path = repair_dir.join(format!("{}-simplified.txt", chunk_id));
    std::fs::write(&simplified_path, &simplified).map_err(|source| PipelineError::Io {
        path: simplified_path.clone(),
        source,
    })?;
    invoke_phase_for_chunk(
        ctx,
        file_id,
        phase,
        chunk_id,
        Vec::new(),
        Some(simplified_path),
        candidate,
        cancel,
    )
    .await
}

/// Confidence for a produced candidate: duration expectation from the
/// chunk text (or the original chunk's recorded duration), RMS as the
/// basic spectral check.
fn score_candidate(
    ctx: &RepairContext<'_>,
    phase: PhaseLabel,
    chunk_id: u32,
    text: Option<&str>,
    candidate: &Path,
) -> Result<f64, PipelineError> {
    let audio = read_wav(candidate)?;
    let actual = audio.duration_seconds();

    let recorded = ctx
        .store
        .read()?
        .phase(phase)
        .and_then(|b| b.chunks.get(&chunk_id))
        .and_then(|c| c.duration_seconds);
    let expected = match (text, recorded) {
        (Some(text), _) if !text.is_empty() => {
            text.chars().count() as f64 / strategies::NARRATION_CHARS_PER_SECOND
        }
        (_, Some(seconds)) => seconds,
        // No expectation available; let validation carry the score.
        _ => actual,
    };

    let validation = (audio.rms() / SPEECH_RMS_FLOOR).clamp(0.0, 1.0);
    Ok(confidence_score(
        &ctx.config.toml.repair,
        expected,
        actual,
        validation,
    ))
}
