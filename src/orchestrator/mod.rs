//! Per-book pipeline orchestration.
//!
//! One `Orchestrator` drives one book through the phase roster: pre-flight,
//! stale-run reaping, override materialization, skip/resume decisions,
//! phase execution, retry scheduling, chunk failure registration, the
//! opt-in repair loop, and the run summary.
//!
//! Locking discipline: the write lock is held only around short read/patch
//! critical sections. It is *never* held across phase execution; a phase
//! can run for days and cancellation, status queries, and sibling batch
//! workers must stay able to make progress.

pub mod summary;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::advisor::{Advisor, ApplyOutcome, Recommendation, RunFacts, TelemetryWindow};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::phase::{PhaseFlag, PhaseLabel, phase_spec};
use crate::repair::{FailureRegistry, RegistryEntry, RepairContext, RepairManifest, run_repair_loop};
use crate::retry::{RetryEngine, RunDecision};
use crate::runner::{ChildReport, PhaseInvocation, PhaseRunner, classify_outcome, child_exit_retriable};
use crate::state::{
    BatchRunRecord, ChunkStatus, ErrorInfo, FailureRecord, OverrideEntry, PhaseStatus,
    PipelineState, SourceInfo, StateStore,
};
use crate::telemetry::{TelemetryEvent, TelemetryRecord, TelemetrySink};
use crate::util::{derive_file_id, mime_class, sha256_hex, sha256_file, truncate_str};

/// Minimum free disk space for a run, in bytes.
const MIN_FREE_DISK: u64 = 1 << 30;

/// Outcome of one phase, collected for the run report.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub label: PhaseLabel,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    pub chunks_total: usize,
    pub chunks_failed: usize,
    pub chunks_repaired: usize,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success,
    Failed { kind: String, message: String },
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    /// Process exit code for this outcome, per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => crate::errors::exit::SUCCESS,
            RunOutcome::Cancelled => crate::errors::exit::CANCELLED,
            RunOutcome::Failed { kind, .. } => match kind.as_str() {
                "busy" => crate::errors::exit::LOCK_BUSY,
                "invalid_patch" | "corrupt_state" => crate::errors::exit::SCHEMA_INVALID,
                _ => crate::errors::exit::FAILURE,
            },
        }
    }
}

/// Structured result of a whole run, rendered by [`summary`].
pub struct RunReport {
    pub file_id: String,
    pub run_id: String,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
    pub phases: Vec<PhaseReport>,
    pub applied_overrides: Vec<OverrideEntry>,
    pub recommendations: Vec<Recommendation>,
    pub repairs: Vec<RepairManifest>,
    pub reward: f64,
    pub log_pointer: PathBuf,
}

pub struct Orchestrator {
    config: Config,
    store: StateStore,
    telemetry: TelemetrySink,
    advisor: Advisor,
    runner: PhaseRunner,
    registry: FailureRegistry,
    cancel: Arc<AtomicBool>,
    run_id: String,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let store = StateStore::open(&config.state_path)
            .map(|s| {
                let wait = Duration::from_secs(config.toml.defaults.lock_wait_secs);
                s.with_backup_retention(config.toml.defaults.backup_retention)
                    .with_lock_wait(wait)
            })?;
        let telemetry = TelemetrySink::new(store.meta_dir().join("telemetry"));
        let advisor = Advisor::new(
            config.toml.advisor.clone(),
            config.learning_mode,
            store.meta_dir().join("policy"),
        );
        let runner = PhaseRunner::new(store.meta_dir().join("logs"));
        let registry = FailureRegistry::new(store.meta_dir());
        Ok(Self {
            config,
            store,
            telemetry,
            advisor,
            runner,
            registry,
            cancel: Arc::new(AtomicBool::new(false)),
            run_id: Uuid::new_v4().to_string(),
        })
    }

    /// Cancellation handle for signal handlers and the `cancel` command.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Marker file the `cancel` subcommand drops for a running instance.
    pub fn cancel_marker(&self) -> PathBuf {
        self.store.meta_dir().join("cancel")
    }

    /// Execute the configured phases for this book.
    pub async fn run(&mut self) -> Result<RunReport, PipelineError> {
        let run_start = Instant::now();
        self.preflight()?;

        let file_id = self.ensure_state()?;
        let marker_watch = self.spawn_cancel_watcher();

        self.telemetry.append(
            TelemetryRecord::new(&file_id, TelemetryEvent::RunStart)
                .with_detail(self.run_id.clone()),
        )?;

        // Advisor consultation and override materialization, under lock.
        let window = TelemetryWindow::from_records(
            &self.telemetry.read_window(self.advisor.window_days())?,
        );
        let recommendations = self
            .advisor
            .recommend(&window, &self.config.toml.defaults);
        let applied = self.materialize_overrides(&file_id, &window, &recommendations)?;

        // Phase sequencing.
        let mut failure: Option<PipelineError> = None;
        for label in self.config.phases.clone() {
            match self.run_phase(&file_id, label, &window).await {
                Ok(()) => {
                    self.run_hooks_after(&file_id, label).await;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Post-run repair loop for still-failed synthesis chunks.
        let mut repairs = Vec::new();
        if self.config.toml.repair.enabled
            && !matches!(failure, Some(PipelineError::Cancelled { .. }))
        {
            let ctx = RepairContext {
                config: &self.config,
                store: &self.store,
                registry: &self.registry,
                telemetry: &self.telemetry,
                runner: &self.runner,
            };
            match run_repair_loop(&ctx, &file_id, Arc::clone(&self.cancel)).await {
                Ok(manifests) => repairs = manifests,
                Err(e) => warn!(error = %e, "repair loop aborted"),
            }
            // A fully repaired synthesis phase settles the failure.
            if let Some(PipelineError::ChunkFailure { .. }) = failure
                && self.try_commit_repaired_phase(PhaseLabel::Synthesize)?
            {
                failure = None;
            }
        }

        marker_watch.abort();
        let _ = std::fs::remove_file(self.cancel_marker());
        self.finish_run(
            &file_id,
            failure,
            run_start.elapsed(),
            &window,
            applied,
            recommendations,
            repairs,
        )
    }

    /// Pre-flight checks: input readable, enough free disk.
    fn preflight(&self) -> Result<(), PipelineError> {
        if let Some(input) = &self.config.input_path
            && !input.is_file()
        {
            return Err(PipelineError::Io {
                path: input.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "input not found"),
            });
        }
        match fs2::available_space(&self.config.workdir) {
            Ok(space) if space < MIN_FREE_DISK => Err(PipelineError::Io {
                path: self.config.workdir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::StorageFull,
                    format!("only {} bytes free", space),
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Create or load the state document; reap a stale holder; register
    /// this run.
    fn ensure_state(&self) -> Result<String, PipelineError> {
        self.store.with_write_lock(|store| {
            let mut state = if store.exists() {
                let mut state = store.read()?;
                reap_stale_run(&mut state);
                state
            } else {
                let input = self.config.input_path.as_ref().ok_or_else(|| {
                    PipelineError::CorruptState {
                        path: store.state_path().to_path_buf(),
                        reason: "no state document and no input to create one from".into(),
                    }
                })?;
                let hash = sha256_file(input).map_err(|source| PipelineError::Io {
                    path: input.clone(),
                    source: std::io::Error::other(source.to_string()),
                })?;
                let size = input
                    .metadata()
                    .map_err(|source| PipelineError::Io {
                        path: input.clone(),
                        source,
                    })?
                    .len();
                PipelineState::new(
                    derive_file_id(&hash),
                    SourceInfo {
                        path: input.display().to_string(),
                        hash,
                        mime: mime_class(input).to_string(),
                        size_bytes: size,
                    },
                )
            };

            state.runtime.pid = Some(std::process::id());
            state.runtime.heartbeat_at = Some(Utc::now());
            state.batch_runs.push(BatchRunRecord {
                run_id: self.run_id.clone(),
                started_at: Utc::now(),
                ended_at: None,
                outcome: None,
            });
            let file_id = state.file_id.clone();
            store.save(&state, None, "run_start")?;
            Ok(file_id)
        })
    }

    /// Background task that maps the cancel marker file onto the flag.
    /// A marker left before the run starts cancels deterministically.
    fn spawn_cancel_watcher(&self) -> tokio::task::JoinHandle<()> {
        let marker = self.cancel_marker();
        if marker.exists() {
            self.cancel.store(true, Ordering::Relaxed);
        }
        let cancel = Arc::clone(&self.cancel);
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_millis(500));
            loop {
                poll.tick().await;
                if marker.exists() {
                    cancel.store(true, Ordering::Relaxed);
                    break;
                }
            }
        })
    }

    /// Build the run's override set (user + advisor) and write it into
    /// `state.overrides`.
    fn materialize_overrides(
        &self,
        file_id: &str,
        window: &TelemetryWindow,
        recommendations: &[Recommendation],
    ) -> Result<Vec<OverrideEntry>, PipelineError> {
        let mut applied = self.config.user_overrides();

        for recommendation in recommendations {
            // Every proposal is a telemetry event; application adds more.
            self.telemetry.append(
                TelemetryRecord::new(file_id, TelemetryEvent::Recommendation)
                    .with_phase(recommendation.phase)
                    .with_detail(format!(
                        "{}={} ({})",
                        recommendation.parameter,
                        recommendation.proposed,
                        recommendation.rationale
                    )),
            )?;
            let baseline = self.config.baseline_parameter(&recommendation.parameter);
            match self
                .advisor
                .gate_and_apply(file_id, window, recommendation, baseline.as_ref())?
            {
                ApplyOutcome::Applied(entry) => {
                    self.telemetry.append(
                        TelemetryRecord::new(file_id, TelemetryEvent::OverrideApplied)
                            .with_phase(recommendation.phase)
                            .with_detail(format!(
                                "{}={}",
                                recommendation.parameter, recommendation.proposed
                            )),
                    )?;
                    applied.push(entry);
                }
                ApplyOutcome::Blocked(gate) => {
                    self.telemetry.append(
                        TelemetryRecord::new(file_id, TelemetryEvent::SafetyBlocked)
                            .with_phase(recommendation.phase)
                            .with_detail(format!("safety_blocked={}", gate)),
                    )?;
                }
                ApplyOutcome::Observed => {}
            }
        }

        let entries = applied.clone();
        self.store.with_write_lock(|store| {
            store.update(None, "overrides_materialized", |state| {
                for entry in &entries {
                    state.overrides.insert(entry.key(), entry.clone());
                }
            })?;
            Ok(())
        })?;
        Ok(applied)
    }

    /// Drive one phase to a terminal state, retrying within budget.
    async fn run_phase(
        &self,
        file_id: &str,
        label: PhaseLabel,
        window: &TelemetryWindow,
    ) -> Result<(), PipelineError> {
        let inputs_hash = {
            let state = self.store.read()?;
            compute_inputs_hash(&state, label, &self.phase_parameters(&state, label))
        };

        // Decision under lock; the phase itself runs without it.
        let decision = self.store.with_write_lock(|store| {
            let decision =
                RetryEngine::decide(store, label, &inputs_hash, self.config.resume)?;
            if decision == RunDecision::Skip {
                store.update(Some(label), "phase_reused", |state| {
                    let block = state.phase_mut(label);
                    if block.status != PhaseStatus::Success {
                        block.status = PhaseStatus::Reused;
                    }
                })?;
            } else {
                store.update(Some(label), "phase_start", |state| {
                    let block = state.phase_mut(label);
                    block.status = PhaseStatus::Running;
                    block.started_at = Some(Utc::now());
                    block.ended_at = None;
                    block.inputs_hash = Some(inputs_hash.clone());
                    state.runtime.current_phase = Some(label);
                    state.runtime.heartbeat_at = Some(Utc::now());
                })?;
            }
            Ok(decision)
        })?;

        if decision == RunDecision::Skip {
            info!(phase = %label, "reusing prior successful result");
            self.telemetry.append(
                TelemetryRecord::new(file_id, TelemetryEvent::PhaseEnd)
                    .with_phase(label)
                    .with_status("reused"),
            )?;
            return Ok(());
        }

        let budget = self.effective_retry_budget(label)?;
        let mut resume = decision == RunDecision::Resume;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.cancel.load(Ordering::Relaxed) {
                return self.persist_cancelled(file_id, label);
            }

            self.telemetry.append(
                TelemetryRecord::new(file_id, TelemetryEvent::PhaseStart)
                    .with_phase(label)
                    .with_detail(format!("attempt {}", attempt)),
            )?;
            self.store.with_write_lock(|store| {
                store.update(Some(label), "phase_attempt", |state| {
                    state.phase_mut(label).attempt += 1;
                    let key = label.as_str().to_string();
                    *state.runtime.retry_counts.entry(key).or_insert(0) = attempt;
                })?;
                Ok(())
            })?;

            let invocation = self.build_invocation(file_id, label, resume, attempt)?;
            let engine = invocation
                .parameters
                .iter()
                .find(|(name, _)| name == "engine")
                .map(|(_, value)| value.clone());
            let report = self.runner.run(&invocation, Arc::clone(&self.cancel)).await?;

            // Re-read and finish under lock: merge any sidecar patch the
            // phase left, then classify against the post-phase state.
            let outcome = self.store.with_write_lock(|store| {
                self.merge_sidecar_patch(store, label)?;
                let state = store.read()?;
                let outcome =
                    classify_outcome(label, &report, &state, &self.config.workdir);
                self.commit_phase_result(store, label, &report, &outcome, &inputs_hash)?;
                Ok(outcome)
            })?;

            let mut end_record = TelemetryRecord::new(file_id, TelemetryEvent::PhaseEnd)
                .with_phase(label)
                .with_duration_ms(report.duration.as_millis() as u64);
            end_record.engine = engine.clone();
            match &outcome {
                Ok(()) => {
                    let state = self.store.read()?;
                    if let Some(block) = state.phase(label)
                        && block.chunk_total() > 0
                    {
                        let rate = block.chunks_with_status(ChunkStatus::Failed) as f64
                            / block.chunk_total() as f64;
                        end_record = end_record.with_metric("chunk_failure_rate", rate);
                    }
                    self.telemetry.append(end_record.with_status("success"))?;
                    info!(phase = %label, attempt, "phase succeeded");
                    return Ok(());
                }
                Err(e) => {
                    let status = match e {
                        PipelineError::Timeout { .. } => "timeout",
                        PipelineError::Cancelled { .. } => "cancelled",
                        _ => "failed",
                    };
                    self.telemetry.append(end_record.with_status(status))?;
                    self.telemetry.append(
                        TelemetryRecord::new(file_id, TelemetryEvent::Failure)
                            .with_phase(label)
                            .with_status(e.kind())
                            .with_detail(truncate_str(&e.to_string(), 300)),
                    )?;
                }
            }
            let error = outcome.unwrap_err();

            if matches!(error, PipelineError::Cancelled { .. }) {
                return self.persist_cancelled(file_id, label);
            }
            self.register_chunk_failures(file_id, label, attempt, engine.as_deref(), &error)?;

            let retriable = match &error {
                PipelineError::ChildExit { .. } => child_exit_retriable(&report),
                _ => error.is_retriable(),
            };
            if !retriable || !RetryEngine::should_retry(&error, attempt, budget) {
                self.store.with_write_lock(|store| {
                    store.update(Some(label), "phase_failed", |state| {
                        let block = state.phase_mut(label);
                        block.status = PhaseStatus::Failed;
                        block.ended_at = Some(Utc::now());
                    })?;
                    Ok(())
                })?;
                return Err(error);
            }

            // Between-attempt advisor mutation (engine swap, chunk-size
            // reduction), behind the same gates as run-start overrides.
            if let Some(recommendation) = self.advisor.recommend_after_failure(
                &error,
                &self.config.toml.defaults,
                &self.config.toml.repair.fallback_engines,
            ) {
                self.telemetry.append(
                    TelemetryRecord::new(file_id, TelemetryEvent::Recommendation)
                        .with_phase(label)
                        .with_detail(format!(
                            "{}={} ({})",
                            recommendation.parameter,
                            recommendation.proposed,
                            recommendation.rationale
                        )),
                )?;
                let baseline = self.config.baseline_parameter(&recommendation.parameter);
                match self.advisor.gate_and_apply(
                    file_id,
                    window,
                    &recommendation,
                    baseline.as_ref(),
                )? {
                    ApplyOutcome::Applied(entry) => {
                        self.telemetry.append(
                            TelemetryRecord::new(file_id, TelemetryEvent::OverrideApplied)
                                .with_phase(label)
                                .with_detail(format!(
                                    "{}={}",
                                    entry.parameter, entry.value
                                )),
                        )?;
                        self.store.with_write_lock(|store| {
                            store.update(Some(label), "override_applied", |state| {
                                state.overrides.insert(entry.key(), entry.clone());
                            })?;
                            Ok(())
                        })?;
                    }
                    ApplyOutcome::Blocked(gate) => {
                        self.telemetry.append(
                            TelemetryRecord::new(file_id, TelemetryEvent::SafetyBlocked)
                                .with_phase(label)
                                .with_detail(format!("safety_blocked={}", gate)),
                        )?;
                    }
                    ApplyOutcome::Observed => {}
                }
            }

            self.telemetry.append(
                TelemetryRecord::new(file_id, TelemetryEvent::PhaseRetry)
                    .with_phase(label)
                    .with_status(error.kind())
                    .with_detail(format!("attempt {} of {}", attempt + 1, budget)),
            )?;
            let delay = RetryEngine::backoff_delay(attempt);
            warn!(phase = %label, attempt, ?delay, error = %error, "retrying after backoff");
            tokio::time::sleep(delay).await;
            // A failed chunked attempt resumes whatever chunks survived.
            resume = phase_spec(label).chunked;
        }
    }

    /// Merge a `patch.json` sidecar the phase may have left in its
    /// artifact directory (the alternative to the phase writing the state
    /// document itself).
    fn merge_sidecar_patch(
        &self,
        store: &StateStore,
        label: PhaseLabel,
    ) -> Result<(), PipelineError> {
        let patch_path = PhaseRunner::phase_dir(&self.config.workdir, label).join("patch.json");
        if !patch_path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&patch_path).map_err(|source| PipelineError::Io {
            path: patch_path.clone(),
            source,
        })?;
        let patch: Value =
            serde_json::from_str(&content).map_err(|e| PipelineError::InvalidPatch {
                phase: label.to_string(),
                reason: format!("sidecar patch unparseable: {}", e),
            })?;
        store.apply(&patch, Some(label), "phase_patch")?;
        std::fs::remove_file(&patch_path).map_err(|source| PipelineError::Io {
            path: patch_path,
            source,
        })?;
        Ok(())
    }

    /// Persist the bookkeeping for one finished attempt (success or not).
    fn commit_phase_result(
        &self,
        store: &StateStore,
        label: PhaseLabel,
        report: &ChildReport,
        outcome: &Result<(), PipelineError>,
        inputs_hash: &str,
    ) -> Result<(), PipelineError> {
        let duration_ms = report.duration.as_millis() as u64;
        let log_pointer = report.log_path.display().to_string();
        store.update(Some(label), "phase_commit", |state| {
            let block = state.phase_mut(label);
            block.ended_at = Some(Utc::now());
            block.duration_ms = Some(duration_ms);
            block.inputs_hash = Some(inputs_hash.to_string());
            match outcome {
                Ok(()) => {
                    block.status = PhaseStatus::Success;
                    block.last_error = None;
                }
                Err(e) => {
                    // Terminal status is decided by the retry loop; record
                    // the error either way.
                    block.last_error = Some(ErrorInfo {
                        kind: e.kind().to_string(),
                        message: truncate_str(&e.to_string(), 500),
                        trace: Some(log_pointer.clone()),
                    });
                }
            }
            state.runtime.heartbeat_at = Some(Utc::now());
        })?;
        Ok(())
    }

    /// Append registry entries and in-state failure records for every
    /// chunk the attempt left failed.
    fn register_chunk_failures(
        &self,
        file_id: &str,
        label: PhaseLabel,
        attempt: u32,
        engine: Option<&str>,
        error: &PipelineError,
    ) -> Result<(), PipelineError> {
        if !matches!(error, PipelineError::ChunkFailure { .. }) {
            return Ok(());
        }
        let state = self.store.read()?;
        let Some(block) = state.phase(label) else {
            return Ok(());
        };
        let failed = block.failed_chunk_ids();
        for chunk_id in &failed {
            let record = FailureRecord {
                category: "chunk_failure".into(),
                phase: label,
                attempt,
                timestamp: Utc::now(),
                message: format!("chunk {} failed validation", chunk_id),
                engine: engine.map(str::to_string),
                parameters: Default::default(),
                log_excerpt: None,
            };
            self.registry.append(&RegistryEntry {
                file_id: file_id.to_string(),
                chunk_id: *chunk_id,
                record: record.clone(),
            })?;
            self.store.with_write_lock(|store| {
                store.update(Some(label), "chunk_failure", |state| {
                    if let Some(chunk) = state.phase_mut(label).chunks.get_mut(chunk_id) {
                        chunk.failures.push(record.clone());
                    }
                })?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// After the repair loop, a synthesis phase whose chunks are now all
    /// usable is committed as success.
    fn try_commit_repaired_phase(&self, label: PhaseLabel) -> Result<bool, PipelineError> {
        self.store.with_write_lock(|store| {
            let state = store.read()?;
            let Some(block) = state.phase(label) else {
                return Ok(false);
            };
            if block.chunk_total() == 0 || block.chunks_usable() != block.chunk_total() {
                return Ok(false);
            }
            crate::runner::verify_artifacts(label, block, &self.config.workdir)?;
            store.update(Some(label), "phase_repaired", |state| {
                let block = state.phase_mut(label);
                block.status = PhaseStatus::Success;
                block.ended_at = Some(Utc::now());
                block.last_error = None;
            })?;
            Ok(true)
        })
    }

    fn persist_cancelled(
        &self,
        file_id: &str,
        label: PhaseLabel,
    ) -> Result<(), PipelineError> {
        self.store.with_write_lock(|store| {
            store.update(Some(label), "cancelled", |state| {
                let block = state.phase_mut(label);
                block.status = PhaseStatus::Cancelled;
                block.ended_at = Some(Utc::now());
            })?;
            Ok(())
        })?;
        self.telemetry.append(
            TelemetryRecord::new(file_id, TelemetryEvent::PhaseEnd)
                .with_phase(label)
                .with_status("cancelled"),
        )?;
        Err(PipelineError::Cancelled {
            phase: label.to_string(),
        })
    }

    /// Effective retry budget: a `max_retries` override in state beats the
    /// config layering.
    fn effective_retry_budget(&self, label: PhaseLabel) -> Result<u32, PipelineError> {
        let state = self.store.read()?;
        Ok(state
            .overrides
            .get(&format!("{}.max_retries", label))
            .and_then(|o| o.value.as_u64())
            .map(|v| v as u32)
            .unwrap_or_else(|| self.config.retry_budget(label)))
    }

    /// Baseline parameters for a phase, folded with the override set.
    fn phase_parameters(&self, state: &PipelineState, label: PhaseLabel) -> Vec<(String, String)> {
        let spec = phase_spec(label);
        let defaults = &self.config.toml.defaults;
        let mut parameters: Vec<(String, String)> = Vec::new();
        if spec.accepts_flag(PhaseFlag::Engine) {
            parameters.push(("engine".into(), defaults.engine.clone()));
        }
        if spec.accepts_flag(PhaseFlag::Voice) {
            parameters.push(("voice".into(), defaults.voice.clone()));
        }
        if label == PhaseLabel::Segment {
            parameters.push(("chunk_chars".into(), defaults.chunk_chars.to_string()));
        }
        if label == PhaseLabel::Synthesize {
            parameters.push(("seed".into(), defaults.synthesis_seed.to_string()));
        }

        for entry in state.overrides_for(label) {
            let value = match &entry.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match parameters.iter_mut().find(|(name, _)| *name == entry.parameter) {
                Some(slot) => slot.1 = value,
                None => parameters.push((entry.parameter.clone(), value)),
            }
        }
        parameters
    }

    fn build_invocation(
        &self,
        file_id: &str,
        label: PhaseLabel,
        resume: bool,
        attempt: u32,
    ) -> Result<PhaseInvocation, PipelineError> {
        let state = self.store.read()?;
        let section = self.config.toml.phase_section(label);
        Ok(PhaseInvocation {
            label,
            command: self.config.toml.phase_command(label),
            file_id: file_id.to_string(),
            state_path: self.config.state_path.clone(),
            workdir: self.config.workdir.clone(),
            resume,
            attempt,
            timeout: Duration::from_secs(self.config.timeout_secs(label)),
            parameters: self.phase_parameters(&state, label),
            env: section.env.into_iter().collect(),
            chunk_id: None,
            input_override: None,
            output_override: None,
        })
    }

    /// Terminal bookkeeping: reward, override ephemerality, runtime reset,
    /// run summary assembly.
    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        file_id: &str,
        failure: Option<PipelineError>,
        duration: Duration,
        window: &TelemetryWindow,
        applied_overrides: Vec<OverrideEntry>,
        recommendations: Vec<Recommendation>,
        repairs: Vec<RepairManifest>,
    ) -> Result<RunReport, PipelineError> {
        let outcome = match &failure {
            None => RunOutcome::Success,
            Some(PipelineError::Cancelled { .. }) => RunOutcome::Cancelled,
            Some(e) => RunOutcome::Failed {
                kind: e.kind().to_string(),
                message: truncate_str(&e.to_string(), 300),
            },
        };

        // Reward facts from the final state.
        let state = self.store.read()?;
        let (chunks_total, chunks_failed, chunks_repaired) =
            state.phases.values().fold((0usize, 0usize, 0usize), |acc, block| {
                (
                    acc.0 + block.chunk_total(),
                    acc.1 + block.chunks_with_status(ChunkStatus::Failed),
                    acc.2 + block.chunks_with_status(ChunkStatus::Repaired),
                )
            });
        let once_failed = chunks_failed + chunks_repaired;
        let facts = RunFacts {
            success: matches!(outcome, RunOutcome::Success),
            duration_ms: duration.as_millis() as u64,
            baseline_duration_ms: baseline_run_duration(window),
            chunk_failure_rate: if chunks_total > 0 {
                once_failed as f64 / chunks_total as f64
            } else {
                0.0
            },
            repair_success_rate: if once_failed > 0 {
                chunks_repaired as f64 / once_failed as f64
            } else {
                0.0
            },
        };
        let reward = crate::advisor::compute_reward(&facts);
        self.advisor.journal_reward(file_id, reward)?;

        // Terminal state mutation: clear single-run overrides (persistent
        // entries survive only under autonomous mode), reset runtime, close
        // the batch-run record.
        let run_id = self.run_id.clone();
        let outcome_str = outcome.as_str().to_string();
        let last_error = failure.as_ref().map(|e| ErrorInfo {
            kind: e.kind().to_string(),
            message: truncate_str(&e.to_string(), 500),
            trace: None,
        });
        let final_state = self.store.with_write_lock(|store| {
            store.update(None, "run_end", |state| {
                state.clear_single_run_overrides();
                state.runtime.current_phase = None;
                state.runtime.pid = None;
                state.runtime.retry_counts.clear();
                state.runtime.last_error = last_error.clone();
                if let Some(record) = state
                    .batch_runs
                    .iter_mut()
                    .rfind(|r| r.run_id == run_id)
                {
                    record.ended_at = Some(Utc::now());
                    record.outcome = Some(outcome_str.clone());
                }
            })
        })?;

        self.telemetry.append(
            TelemetryRecord::new(file_id, TelemetryEvent::RunEnd)
                .with_status(outcome.as_str())
                .with_duration_ms(duration.as_millis() as u64)
                .with_metric("reward", reward),
        )?;

        // Post-phase hooks for the terminal phase set, then the report.
        let phases = self
            .config
            .phases
            .iter()
            .map(|label| {
                let block = final_state.phase(*label);
                PhaseReport {
                    label: *label,
                    status: block.map(|b| b.status).unwrap_or_default(),
                    duration_ms: block.and_then(|b| b.duration_ms).unwrap_or(0),
                    attempts: block.map(|b| b.attempt).unwrap_or(0),
                    chunks_total: block.map(|b| b.chunk_total()).unwrap_or(0),
                    chunks_failed: block
                        .map(|b| b.chunks_with_status(ChunkStatus::Failed))
                        .unwrap_or(0),
                    chunks_repaired: block
                        .map(|b| b.chunks_with_status(ChunkStatus::Repaired))
                        .unwrap_or(0),
                }
            })
            .collect();

        Ok(RunReport {
            file_id: file_id.to_string(),
            run_id: self.run_id.clone(),
            outcome,
            duration_ms: duration.as_millis() as u64,
            phases,
            applied_overrides,
            recommendations,
            repairs,
            reward,
            log_pointer: self.store.meta_dir().join("logs"),
        })
    }

    /// Run configured post-phase hooks after a phase settled. Never blocks
    /// pipeline progress: failures are logged inside the hook layer.
    async fn run_hooks_after(&self, file_id: &str, label: PhaseLabel) {
        let hooks = self.config.toml.hooks.post_phase.clone();
        if hooks.is_empty() {
            return;
        }
        let (status, duration_ms) = match self.store.read() {
            Ok(state) => match state.phase(label) {
                Some(block) => (
                    format!("{:?}", block.status).to_lowercase(),
                    block.duration_ms.unwrap_or(0),
                ),
                None => ("unknown".into(), 0),
            },
            Err(_) => ("unknown".into(), 0),
        };
        let context = crate::hooks::HookContext::post_phase(
            file_id,
            label,
            &status,
            duration_ms,
            self.config.state_path.clone(),
            self.config.workdir.clone(),
        );
        crate::hooks::run_post_phase_hooks(&hooks, &context).await;
    }
}

/// Mean duration of recent terminal runs; feeds the reward's duration term.
fn baseline_run_duration(window: &TelemetryWindow) -> Option<f64> {
    if window.runs == 0 {
        return None;
    }
    // The window folds run_end durations into rewards only; recompute the
    // baseline from phase durations as an approximation when no run-level
    // numbers exist.
    let total: f64 = window.phases.values().map(|s| s.avg_duration_ms).sum();
    if total > 0.0 { Some(total) } else { None }
}

/// Demote in-flight work left behind by a dead orchestrator.
///
/// Called with the write lock held, before any new run. A `running` block
/// whose recorded pid is no longer alive becomes `failed` so the retry
/// engine treats it as resumable.
pub fn reap_stale_run(state: &mut PipelineState) {
    let Some(pid) = state.runtime.pid else {
        return;
    };
    if pid == std::process::id() {
        return;
    }
    let system = sysinfo::System::new_all();
    if system.process(sysinfo::Pid::from_u32(pid)).is_some() {
        return;
    }
    warn!(pid, "reaping state held by dead orchestrator");
    for block in state.phases.values_mut() {
        if block.status == PhaseStatus::Running {
            block.status = PhaseStatus::Failed;
            block.last_error = Some(ErrorInfo {
                kind: "stale".into(),
                message: format!("orchestrator pid {} died mid-phase", pid),
                trace: None,
            });
        }
    }
    state.runtime.pid = None;
    state.runtime.current_phase = None;
}

/// Content hash of everything a phase consumes: source identity, the
/// upstream phase's outputs, and the effective parameters. Seeded
/// synthesis folds its seed in so reuse stays sound.
pub fn compute_inputs_hash(
    state: &PipelineState,
    label: PhaseLabel,
    parameters: &[(String, String)],
) -> String {
    let mut payload = String::new();
    payload.push_str(&state.source.hash);
    payload.push('|');
    payload.push_str(label.as_str());

    // The closest preceding phase's recorded hashes stand in for the
    // upstream artifacts themselves.
    let roster = PhaseLabel::all();
    if let Some(position) = roster.iter().position(|l| *l == label) {
        for upstream in roster[..position].iter().rev() {
            if let Some(block) = state.phase(*upstream) {
                if let Some(hash) = &block.inputs_hash {
                    payload.push('|');
                    payload.push_str(hash);
                }
                for artifact in &block.artifacts {
                    if let Some(hash) = &artifact.hash {
                        payload.push('|');
                        payload.push_str(hash);
                    }
                }
                break;
            }
        }
    }

    for (name, value) in parameters {
        payload.push('|');
        payload.push_str(name);
        payload.push('=');
        payload.push_str(value);
    }
    sha256_hex(payload.as_bytes())
}
