//! Code execution: materialize source to a temp file, run the interpreter
//! for the language, clean up. One fresh interpreter process per call; no
//! state is shared between executions.

use std::path::PathBuf;

use crate::config::Config;
use crate::error::OpError;
use crate::runner;
use crate::types::{ExecutionResult, Language};

/// Per-language execution capability: interpreter binary, source extension,
/// and the workspace the interpreter starts in by default.
struct CodeLang {
    interpreter: &'static str,
    extension: &'static str,
}

fn code_lang(lang: Language) -> Option<CodeLang> {
    match lang {
        Language::Js => Some(CodeLang {
            interpreter: "node",
            extension: "js",
        }),
        Language::Ts => Some(CodeLang {
            interpreter: "tsx",
            extension: "ts",
        }),
        Language::Py => Some(CodeLang {
            interpreter: "python",
            extension: "py",
        }),
        Language::Shell => None,
    }
}

fn default_cwd(config: &Config, lang: Language) -> PathBuf {
    match lang {
        Language::Js | Language::Ts => config.js_ts_dir(),
        Language::Py => config.py_dir(),
        Language::Shell => config.sandbox_root.clone(),
    }
}

/// Unique temp script path. The suffix is random, never derived from the
/// code: two identical concurrent executions must not share a file.
fn temp_script_path(extension: &str) -> PathBuf {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..12];
    std::env::temp_dir().join(format!("exec-{suffix}.{extension}"))
}

/// Sentinel result for expected execution-request failures (empty code,
/// cwd escape). These are user errors, not internal ones.
fn failed_result(lang: Language, stderr: String) -> ExecutionResult {
    ExecutionResult {
        stdout: String::new(),
        stderr,
        exit_code: 1,
        language: lang.as_str(),
    }
}

/// Execute one request: shell commands go straight to the runner, code
/// languages through a temp script file.
pub(crate) async fn execute_request(
    config: &Config,
    command: &str,
    lang: Language,
    cwd: Option<&str>,
    timeout_secs: Option<u64>,
) -> Result<ExecutionResult, OpError> {
    let timeout_ms = runner::timeout_ms_from_secs(timeout_secs);

    // Explicit working directories are confined like any other user path.
    let cwd = match cwd {
        None => default_cwd(config, lang),
        Some(p) => match crate::paths::resolve(&config.sandbox_root, p) {
            Ok(resolved) => resolved,
            Err(e) => {
                return Ok(failed_result(
                    lang,
                    format!("Working directory rejected: {e} (sandbox escape)\n"),
                ));
            }
        },
    };

    match lang {
        Language::Shell => {
            let out = runner::run(config, command, Some(&cwd), timeout_ms).await?;
            Ok(ExecutionResult {
                stdout: out.stdout,
                stderr: out.stderr,
                exit_code: out.exit_code,
                language: lang.as_str(),
            })
        }
        _ => execute_code(config, command, lang, &cwd, timeout_ms).await,
    }
}

async fn execute_code(
    config: &Config,
    code: &str,
    lang: Language,
    cwd: &std::path::Path,
    timeout_ms: u64,
) -> Result<ExecutionResult, OpError> {
    let spec = code_lang(lang).expect("shell handled by caller");

    if code.trim().is_empty() {
        return Ok(failed_result(
            lang,
            format!("No {} code provided\n", lang.as_str()),
        ));
    }

    let script_path = temp_script_path(spec.extension);
    tokio::fs::write(&script_path, code)
        .await
        .map_err(|e| OpError::internal(format!("failed to write script file: {e}")))?;

    let command = format!("{} '{}'", spec.interpreter, script_path.display());
    let result = runner::run(config, &command, Some(cwd), timeout_ms).await;

    if let Err(e) = tokio::fs::remove_file(&script_path).await {
        tracing::warn!(path = %script_path.display(), error = %e, "temp script cleanup failed");
    }

    let out = result?;
    Ok(ExecutionResult {
        stdout: out.stdout,
        stderr: out.stderr,
        exit_code: out.exit_code,
        language: lang.as_str(),
    })
}

// ============================================================================
// Tests
// ============================================================================
