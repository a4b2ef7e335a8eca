//! Phase execution as an external child process.
//!
//! The runner resolves the phase's command, injects overrides onto the
//! declared flag surface (environment variables for anything else), streams
//! child output to a per-phase log file, enforces the deadline with
//! terminate-then-kill, and classifies the outcome.
//!
//! Exit code 0 alone never counts as success: the post-phase state must
//! report `success`, every chunk must be usable, and every referenced
//! artifact must exist non-empty. This is the guard against a phase that
//! dies quietly after claiming victory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::phase::{PhaseFlag, PhaseLabel, phase_spec};
use crate::state::{PhaseBlock, PipelineState};
use crate::util::truncate_str;

/// Grace period between terminate and kill.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// How much stderr tail is retained for heuristic classification.
const STDERR_TAIL_LINES: usize = 50;

/// Structured exit channel: phases write this next to their artifacts.
/// Preferred over stderr heuristics whenever present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResultFile {
    pub status: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Everything needed to launch one phase attempt.
#[derive(Debug, Clone)]
pub struct PhaseInvocation {
    pub label: PhaseLabel,
    pub command: String,
    pub file_id: String,
    pub state_path: PathBuf,
    pub workdir: PathBuf,
    pub resume: bool,
    pub attempt: u32,
    pub timeout: Duration,
    /// Parameter -> value, already flattened from the override set.
    pub parameters: Vec<(String, String)>,
    /// Extra child environment from `[phases.<label>] env`.
    pub env: Vec<(String, String)>,
    /// Restrict the run to one chunk (repair loop).
    pub chunk_id: Option<u32>,
    /// Override the input text file (repair sub-units).
    pub input_override: Option<PathBuf>,
    /// Redirect the produced artifact (repair candidates land outside the
    /// phase's own directory so originals stay untouched).
    pub output_override: Option<PathBuf>,
}

/// Raw result of one child execution, before outcome classification.
#[derive(Debug)]
pub struct ChildReport {
    pub exit_code: i32,
    pub duration: Duration,
    pub log_path: PathBuf,
    pub stderr_tail: Vec<String>,
    pub result_file: Option<PhaseResultFile>,
    pub timed_out: bool,
    pub cancelled: bool,
}

pub struct PhaseRunner {
    log_dir: PathBuf,
}

impl PhaseRunner {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Directory a phase owns for its artifacts.
    pub fn phase_dir(workdir: &Path, label: PhaseLabel) -> PathBuf {
        workdir.join(label.name())
    }

    fn build_command(&self, inv: &PhaseInvocation) -> Command {
        let spec = phase_spec(inv.label);
        let mut cmd = Command::new(&inv.command);
        cmd.arg(format!("--file_id={}", inv.file_id));
        cmd.arg(format!("--json_path={}", inv.state_path.display()));

        if inv.resume && spec.accepts_flag(PhaseFlag::Resume) {
            cmd.arg("--resume");
        }
        if let Some(chunk_id) = inv.chunk_id
            && spec.accepts_flag(PhaseFlag::ChunkId)
        {
            cmd.arg(format!("--chunk_id={}", chunk_id));
        }
        for (parameter, value) in &inv.parameters {
            let flag = match parameter.as_str() {
                "voice" if spec.accepts_flag(PhaseFlag::Voice) => Some("--voice"),
                "engine" if spec.accepts_flag(PhaseFlag::Engine) => Some("--engine"),
                "max_retries" if spec.accepts_flag(PhaseFlag::MaxRetries) => Some("--max-retries"),
                _ => None,
            };
            match flag {
                Some(flag) => {
                    cmd.arg(format!("{}={}", flag, value));
                }
                None => {
                    // Off-surface parameters travel as environment.
                    cmd.env(format!("BOOKWRIGHT_{}", parameter.to_uppercase()), value);
                }
            }
        }
        if let Some(input) = &inv.input_override {
            cmd.env("BOOKWRIGHT_INPUT_OVERRIDE", input.as_os_str());
        }
        if let Some(output) = &inv.output_override {
            cmd.env("BOOKWRIGHT_OUTPUT_OVERRIDE", output.as_os_str());
        }
        for (key, value) in &inv.env {
            cmd.env(key, value);
        }
        cmd.current_dir(&inv.workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    /// Run one phase attempt to completion, deadline, or cancellation.
    pub async fn run(
        &self,
        inv: &PhaseInvocation,
        cancel: Arc<AtomicBool>,
    ) -> Result<ChildReport, PipelineError> {
        std::fs::create_dir_all(&self.log_dir).map_err(|source| PipelineError::Io {
            path: self.log_dir.clone(),
            source,
        })?;
        let log_path = self.log_dir.join(format!(
            "{}-attempt-{}.log",
            inv.label.name(),
            inv.attempt
        ));
        let mut log_file = tokio::fs::File::create(&log_path)
            .await
            .map_err(|source| PipelineError::Io {
                path: log_path.clone(),
                source,
            })?;

        let mut cmd = self.build_command(inv);
        debug!(phase = %inv.label, command = %inv.command, attempt = inv.attempt, "spawning phase");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| PipelineError::Io {
            path: PathBuf::from(&inv.command),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

        let deadline = tokio::time::sleep(inv.timeout);
        tokio::pin!(deadline);
        let mut cancel_poll = tokio::time::interval(Duration::from_millis(500));

        let mut stderr_tail: Vec<String> = Vec::new();
        let mut stdout_open = stdout_lines.is_some();
        let mut stderr_open = stderr_lines.is_some();
        let mut timed_out = false;
        let mut was_cancelled = false;

        let status = loop {
            tokio::select! {
                line = next_line(&mut stdout_lines), if stdout_open => {
                    match line {
                        Some(line) => {
                            let _ = log_file.write_all(line.as_bytes()).await;
                            let _ = log_file.write_all(b"\n").await;
                        }
                        None => stdout_open = false,
                    }
                }
                line = next_line(&mut stderr_lines), if stderr_open => {
                    match line {
                        Some(line) => {
                            let _ = log_file.write_all(b"[stderr] ").await;
                            let _ = log_file.write_all(line.as_bytes()).await;
                            let _ = log_file.write_all(b"\n").await;
                            if stderr_tail.len() >= STDERR_TAIL_LINES {
                                stderr_tail.remove(0);
                            }
                            stderr_tail.push(line);
                        }
                        None => stderr_open = false,
                    }
                }
                status = child.wait() => {
                    break status.map_err(|source| PipelineError::Io {
                        path: PathBuf::from(&inv.command),
                        source,
                    })?;
                }
                () = &mut deadline => {
                    timed_out = true;
                    warn!(phase = %inv.label, "deadline exceeded, terminating child");
                    break terminate_child(&mut child).await?;
                }
                _ = cancel_poll.tick() => {
                    if cancel.load(Ordering::Relaxed) {
                        was_cancelled = true;
                        warn!(phase = %inv.label, "cancellation requested, terminating child");
                        break terminate_child(&mut child).await?;
                    }
                }
            }
        };

        // Drain whatever output remains after exit.
        while let Some(line) = next_line(&mut stdout_lines).await {
            let _ = log_file.write_all(line.as_bytes()).await;
            let _ = log_file.write_all(b"\n").await;
        }
        while let Some(line) = next_line(&mut stderr_lines).await {
            let _ = log_file.write_all(b"[stderr] ").await;
            let _ = log_file.write_all(line.as_bytes()).await;
            let _ = log_file.write_all(b"\n").await;
            if stderr_tail.len() >= STDERR_TAIL_LINES {
                stderr_tail.remove(0);
            }
            stderr_tail.push(line);
        }
        let _ = log_file.flush().await;

        // Structured exit channel, in order of trust: the result.json the
        // phase wrote next to its artifacts, then a result object printed
        // to stderr (legacy phases that died before writing the file).
        let result_file = read_result_file(&Self::phase_dir(&inv.workdir, inv.label))
            .or_else(|| result_from_stderr(&stderr_tail));

        Ok(ChildReport {
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
            log_path,
            stderr_tail,
            result_file,
            timed_out,
            cancelled: was_cancelled,
        })
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Graceful stop: SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate_child(child: &mut Child) -> Result<std::process::ExitStatus, PipelineError> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return status.map_err(|source| PipelineError::Io {
                path: PathBuf::from("child"),
                source,
            });
        }
    }
    let _ = child.start_kill();
    child.wait().await.map_err(|source| PipelineError::Io {
        path: PathBuf::from("child"),
        source,
    })
}

/// Load the structured result a phase wrote next to its artifacts.
fn read_result_file(phase_dir: &Path) -> Option<PhaseResultFile> {
    let path = phase_dir.join("result.json");
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Recover a structured result object from the stderr tail. Some phases
/// print their result instead of (or before failing to) writing the file;
/// brace-counting digs it out of surrounding log noise.
fn result_from_stderr(tail: &[String]) -> Option<PhaseResultFile> {
    let joined = tail.join("\n");
    let object = crate::util::extract_json_object(&joined)?;
    serde_json::from_str(&object).ok()
}

/// Categories a phase may report in `result.json` that are permanent;
/// they downgrade `ChildExit` to non-retriable.
const PERMANENT_CATEGORIES: &[&str] = &["unsupported_input", "bad_arguments", "license"];

/// Heuristic stderr patterns, used only when no `result.json` was written.
fn classify_stderr(tail: &[String]) -> Option<&'static str> {
    let patterns: &[(&str, &str)] = &[
        (r"(?i)out of memory|cuda.*memory|oom", "resource_exhausted"),
        (r"(?i)no such file|not found", "missing_dependency"),
        (r"(?i)permission denied", "permission"),
        (r"(?i)timed? ?out", "timeout"),
    ];
    let joined = tail.join("\n");
    for (pattern, category) in patterns {
        if regex::Regex::new(pattern)
            .map(|re| re.is_match(&joined))
            .unwrap_or(false)
        {
            return Some(category);
        }
    }
    None
}

/// Robust outcome classification over the post-phase state.
///
/// Success requires, all together: exit code 0, block status `success`,
/// every chunk usable, and every referenced artifact non-empty on disk.
pub fn classify_outcome(
    label: PhaseLabel,
    report: &ChildReport,
    state: &PipelineState,
    workdir: &Path,
) -> Result<(), PipelineError> {
    if report.cancelled {
        return Err(PipelineError::Cancelled {
            phase: label.to_string(),
        });
    }
    if report.timed_out {
        return Err(PipelineError::Timeout {
            phase: label.to_string(),
            timeout_secs: report.duration.as_secs(),
        });
    }
    if report.exit_code != 0 {
        return Err(child_exit_error(label, report));
    }

    let Some(block) = state.phase(label) else {
        return Err(PipelineError::ChildExit {
            phase: label.to_string(),
            exit_code: 0,
            message: "phase wrote no state block".into(),
        });
    };
    if !block.status.is_terminal_success() {
        // The child claimed success via exit code but the state disagrees.
        let failed = block.failed_chunk_ids().len();
        if failed > 0 {
            return Err(PipelineError::ChunkFailure {
                phase: label.to_string(),
                failed,
                total: block.chunk_total(),
            });
        }
        return Err(PipelineError::ChildExit {
            phase: label.to_string(),
            exit_code: 0,
            message: format!("state block reports {:?}", block.status),
        });
    }

    let usable = block.chunks_usable();
    if usable != block.chunk_total() {
        return Err(PipelineError::ChunkFailure {
            phase: label.to_string(),
            failed: block.chunk_total() - usable,
            total: block.chunk_total(),
        });
    }

    verify_artifacts(label, block, workdir)
}

/// Every referenced artifact must resolve to a non-empty file.
pub fn verify_artifacts(
    label: PhaseLabel,
    block: &PhaseBlock,
    workdir: &Path,
) -> Result<(), PipelineError> {
    let check = |rel: &str| -> Result<(), PipelineError> {
        let path = workdir.join(rel);
        let ok = path
            .metadata()
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(PipelineError::ArtifactMissing {
                phase: label.to_string(),
                path,
            })
        }
    };
    for artifact in &block.artifacts {
        check(&artifact.path)?;
    }
    for chunk in block.chunks.values() {
        if chunk.status.is_usable() {
            match chunk.effective_artifact_path() {
                Some(rel) => check(rel)?,
                None => {
                    return Err(PipelineError::ArtifactMissing {
                        phase: label.to_string(),
                        path: workdir.join("<unset>"),
                    });
                }
            }
        }
    }
    Ok(())
}

fn child_exit_error(label: PhaseLabel, report: &ChildReport) -> PipelineError {
    let (category, message) = match &report.result_file {
        Some(result) => (
            result.category.clone(),
            result
                .message
                .clone()
                .unwrap_or_else(|| format!("status={}", result.status)),
        ),
        None => {
            let category = classify_stderr(&report.stderr_tail).map(str::to_string);
            let message = report
                .stderr_tail
                .last()
                .map(|l| truncate_str(l, 200))
                .unwrap_or_else(|| "no output captured".into());
            (category, message)
        }
    };
    let message = match &category {
        Some(category) => format!("[{}] {}", category, message),
        None => message,
    };
    PipelineError::ChildExit {
        phase: label.to_string(),
        exit_code: report.exit_code,
        message,
    }
}

/// Whether a `ChildExit` is retriable given its structured category.
pub fn child_exit_retriable(report: &ChildReport) -> bool {
    match &report.result_file {
        Some(result) => !result
            .category
            .as_deref()
            .map(|c| PERMANENT_CATEGORIES.contains(&c))
            .unwrap_or(false),
        None => true,
    }
}
