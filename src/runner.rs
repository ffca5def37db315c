//! Child process execution with the curated sandbox environment.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::{Duration, timeout};

use crate::config::Config;
use crate::constants::*;
use crate::error::{
    OpError, exit_code_from_status, graceful_terminate_process_group, spawn_capped_reader,
};

/// Raw outcome of one child process run. Non-zero exits and timeouts are
/// values; only spawn failures surface as errors.
#[derive(Debug)]
pub(crate) struct RunOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
    pub(crate) timed_out: bool,
}

/// Environment overrides applied to every child: per-language binary
/// directories on PATH, Node module resolution, and the venv activated the
/// way `source venv/bin/activate` would.
pub(crate) fn executor_env(config: &Config) -> Vec<(String, String)> {
    let node_bin = config.js_ts_dir().join("node_modules/.bin");
    let venv_bin = config.venv_dir().join("bin");
    let parent_path = std::env::var("PATH").unwrap_or_default();
    vec![
        (
            "PATH".to_string(),
            format!(
                "{}:{}:{}",
                node_bin.display(),
                venv_bin.display(),
                parent_path
            ),
        ),
        (
            "NODE_PATH".to_string(),
            config.js_ts_dir().join("node_modules").display().to_string(),
        ),
        (
            "VIRTUAL_ENV".to_string(),
            config.venv_dir().display().to_string(),
        ),
        ("PYTHONHOME".to_string(), String::new()),
    ]
}

/// Run a command through the system shell, capturing both streams fully.
///
/// On timeout the process group is terminated (SIGTERM, grace, SIGKILL) and
/// partial output is returned with exit code 124 plus a note on stderr.
pub(crate) async fn run(
    config: &Config,
    command: &str,
    cwd: Option<&Path>,
    timeout_ms: u64,
) -> Result<RunOutput, OpError> {
    let cwd = cwd.unwrap_or(&config.sandbox_root);

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    for (key, value) in executor_env(config) {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| OpError::internal(format!("failed to spawn shell: {e}")))?;

    let stdout_task = spawn_capped_reader(child.stdout.take().unwrap(), MAX_EXEC_OUTPUT_BYTES);
    let stderr_task = spawn_capped_reader(child.stderr.take().unwrap(), MAX_EXEC_OUTPUT_BYTES);

    let (exit_code, timed_out) = match timeout(Duration::from_millis(timeout_ms), child.wait()).await
    {
        Ok(Ok(status)) => (exit_code_from_status(status), false),
        Ok(Err(e)) => {
            graceful_terminate_process_group(&mut child, TERM_GRACE_PERIOD_SECONDS).await;
            return Err(OpError::internal(format!("wait failed: {e}")));
        }
        Err(_) => {
            graceful_terminate_process_group(&mut child, TERM_GRACE_PERIOD_SECONDS).await;
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    // Terminating the group closed the pipes, so the readers finish even
    // after a timeout.
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Command timed out after {} seconds\n",
            timeout_ms / 1000
        ));
    }

    Ok(RunOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr,
        exit_code,
        timed_out,
    })
}

/// Clamp a caller-supplied timeout in seconds to the allowed range,
/// returning milliseconds.
pub(crate) fn timeout_ms_from_secs(timeout_secs: Option<u64>) -> u64 {
    timeout_secs
        .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECONDS)
        .clamp(1, MAX_TIMEOUT_SECONDS)
        * 1000
}

// ============================================================================
// Tests
// ============================================================================
