//! Post-phase hooks.
//!
//! Hooks are external commands from `[hooks] post_phase` invoked after each
//! phase with a JSON context on stdin (verdict checks, ASR spot-checks,
//! metadata generation). Hook failures are logged and never fail the run;
//! their outputs are additive.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::phase::PhaseLabel;

/// Hook execution deadline; a spot-check that hangs must not stall the
/// pipeline between phases.
const HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// Context serialized to each hook's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: String,
    pub file_id: String,
    pub phase: PhaseLabel,
    pub status: String,
    pub duration_ms: u64,
    pub state_path: PathBuf,
    pub workdir: PathBuf,
}

impl HookContext {
    pub fn post_phase(
        file_id: &str,
        phase: PhaseLabel,
        status: &str,
        duration_ms: u64,
        state_path: PathBuf,
        workdir: PathBuf,
    ) -> Self {
        Self {
            event: "post_phase".into(),
            file_id: file_id.to_string(),
            phase,
            status: status.to_string(),
            duration_ms,
            state_path,
            workdir,
        }
    }
}

/// Run every configured post-phase hook. Individual failures are logged
/// and swallowed.
pub async fn run_post_phase_hooks(commands: &[String], context: &HookContext) {
    for command in commands {
        if let Err(e) = run_hook(command, context).await {
            warn!(hook = %command, error = %e, "post-phase hook failed");
        }
    }
}

async fn run_hook(command: &str, context: &HookContext) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(context)?;
    let mut child = tokio::process::Command::new(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir(&context.workdir)
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&payload).await;
    }
    let status = tokio::time::timeout(HOOK_TIMEOUT, child.wait()).await;
    match status {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => anyhow::bail!("hook exited with {}", status),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            let _ = child.start_kill();
            anyhow::bail!("hook timed out after {:?}", HOOK_TIMEOUT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn context(workdir: PathBuf) -> HookContext {
        HookContext::post_phase(
            "f1",
            PhaseLabel::Synthesize,
            "success",
            1234,
            workdir.join("pipeline.json"),
            workdir,
        )
    }

    #[test]
    fn test_context_serializes_event_and_phase() {
        let json = serde_json::to_value(context(PathBuf::from("/work"))).unwrap();
        assert_eq!(json["event"], "post_phase");
        assert_eq!(json["phase"], "phase4");
        assert_eq!(json["status"], "success");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hook_receives_context_on_stdin() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let out = dir.path().join("seen.json");
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, format!("#!/bin/sh\ncat > {}\n", out.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        run_post_phase_hooks(
            &[script.display().to_string()],
            &context(dir.path().to_path_buf()),
        )
        .await;

        let seen: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(seen["file_id"], "f1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_hook_is_swallowed() {
        let dir = tempdir().unwrap();
        // Missing command and failing command both only warn.
        run_post_phase_hooks(
            &["/nonexistent/hook".into(), "false".into()],
            &context(dir.path().to_path_buf()),
        )
        .await;
    }
}
