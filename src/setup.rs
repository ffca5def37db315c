//! Execution environment preparation: per-language workspaces, dependency
//! installation, and the one-shot user init script.

use std::collections::HashMap;
use std::path::Path;

use crate::config::Config;
use crate::constants::*;
use crate::runner;
use crate::types::InstallReport;

// ============================================================================
// Workspace preparation
// ============================================================================

const PACKAGE_MANIFEST: &str = "{\n  \"name\": \"sandbox\",\n  \"type\": \"module\"\n}\n";

/// Create the Node workspace unless the image already provisioned it.
/// Returns true when pre-provisioned.
pub(crate) async fn prepare_node_workspace(config: &Config) -> std::io::Result<bool> {
    let dir = config.js_ts_dir();
    let manifest = dir.join("package.json");
    let node_modules = dir.join("node_modules");
    if manifest.exists() && node_modules.exists() {
        tracing::info!(dir = %dir.display(), "node workspace pre-provisioned");
        return Ok(true);
    }
    tokio::fs::create_dir_all(&dir).await?;
    if !manifest.exists() {
        tokio::fs::write(&manifest, PACKAGE_MANIFEST).await?;
    }
    tokio::fs::create_dir_all(&node_modules).await?;
    tracing::info!(dir = %dir.display(), "node workspace created");
    Ok(false)
}

/// Create the Python venv unless it already exists. Venv creation runs with
/// a clean environment: an inherited PYTHONHOME or VIRTUAL_ENV would poison
/// the new interpreter.
pub(crate) async fn prepare_venv(config: &Config) -> std::io::Result<bool> {
    let venv = config.venv_dir();
    if venv.exists() {
        tracing::info!(venv = %venv.display(), "python venv pre-provisioned");
        return Ok(true);
    }
    tokio::fs::create_dir_all(config.py_dir()).await?;

    let status = tokio::process::Command::new("python3")
        .arg("-m")
        .arg("venv")
        .arg(&venv)
        .env_remove("PYTHONHOME")
        .env_remove("VIRTUAL_ENV")
        .status()
        .await?;
    if !status.success() {
        tracing::warn!(venv = %venv.display(), ?status, "venv creation failed");
    } else {
        tracing::info!(venv = %venv.display(), "python venv created");
    }
    Ok(false)
}

// ============================================================================
// Dependency installation
// ============================================================================

/// Reject package specs that could smuggle shell syntax or local paths into
/// the package-manager invocation.
pub(crate) fn validate_package_spec(spec: &str) -> Result<(), String> {
    if spec.is_empty() {
        return Err("package spec cannot be empty".into());
    }
    if spec.len() > 214 {
        return Err(format!("package spec too long: {} chars", spec.len()));
    }
    if spec.contains("..") || spec.contains('\\') {
        return Err(format!("invalid package spec: '{spec}'"));
    }
    // '/' stays allowed for npm scopes (@types/node); '..' is blocked above.
    let ok = spec.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'_' | b'-'
                    | b'.'
                    | b'@'
                    | b'/'
                    | b'='
                    | b'<'
                    | b'>'
                    | b'~'
                    | b'^'
                    | b'*'
                    | b'['
                    | b']'
                    | b','
                    | b' '
            )
    });
    if !ok || spec.starts_with('-') {
        return Err(format!("invalid package spec: '{spec}'"));
    }
    Ok(())
}

/// Install Node dependencies one at a time so a single broken package does
/// not sink the batch. 120 s per package.
pub(crate) async fn install_node(
    config: &Config,
    deps: &HashMap<String, String>,
) -> InstallReport {
    let mut report = InstallReport {
        success: true,
        ..Default::default()
    };
    let cwd = config.js_ts_dir();

    for (pkg, version) in deps {
        let spec = if version.trim().is_empty() {
            pkg.clone()
        } else {
            format!("{pkg}@{version}")
        };
        if let Err(e) = validate_package_spec(&spec) {
            tracing::warn!(package = %spec, error = %e, "skipping invalid node dependency");
            report.success = false;
            report.failed.push(spec);
            continue;
        }
        let command = format!("npm install --no-audit --no-fund '{spec}'");
        match runner::run(
            config,
            &command,
            Some(&cwd),
            PACKAGE_INSTALL_TIMEOUT_SECONDS * 1000,
        )
        .await
        {
            Ok(out) if out.exit_code == 0 => {
                tracing::info!(package = %spec, "node dependency installed");
                report.installed.push(spec);
            }
            Ok(out) => {
                tracing::warn!(
                    package = %spec,
                    exit_code = out.exit_code,
                    stderr = %out.stderr.trim(),
                    "node dependency install failed"
                );
                report.success = false;
                report.failed.push(spec);
            }
            Err(e) => {
                tracing::warn!(package = %spec, error = %e, "node dependency install error");
                report.success = false;
                report.failed.push(spec);
            }
        }
    }
    report
}

/// Parse requirements-format text: one spec per line, blanks and `#`
/// comments skipped.
pub(crate) fn parse_requirements(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Install Python requirements through the venv's pip, one entry at a time,
/// 120 s each.
pub(crate) async fn install_python(config: &Config, requirements: &str) -> InstallReport {
    let mut report = InstallReport {
        success: true,
        ..Default::default()
    };
    let pip = config.venv_dir().join("bin/pip");
    let cwd = config.py_dir();

    for spec in parse_requirements(requirements) {
        if let Err(e) = validate_package_spec(&spec) {
            tracing::warn!(requirement = %spec, error = %e, "skipping invalid python requirement");
            report.success = false;
            report.failed.push(spec);
            continue;
        }
        let command = format!("'{}' install '{spec}'", pip.display());
        match runner::run(
            config,
            &command,
            Some(&cwd),
            PACKAGE_INSTALL_TIMEOUT_SECONDS * 1000,
        )
        .await
        {
            Ok(out) if out.exit_code == 0 => {
                tracing::info!(requirement = %spec, "python requirement installed");
                report.installed.push(spec);
            }
            Ok(out) => {
                tracing::warn!(
                    requirement = %spec,
                    exit_code = out.exit_code,
                    stderr = %out.stderr.trim(),
                    "python requirement install failed"
                );
                report.success = false;
                report.failed.push(spec);
            }
            Err(e) => {
                tracing::warn!(requirement = %spec, error = %e, "python requirement install error");
                report.success = false;
                report.failed.push(spec);
            }
        }
    }
    report
}

/// Full environment setup: workspaces, then both dependency sets. Install
/// failures are logged and reported but never abort startup.
pub(crate) async fn setup_execution_environment(
    config: &Config,
    node_dependencies: &HashMap<String, String>,
    python_requirements: &str,
) {
    if let Err(e) = prepare_node_workspace(config).await {
        tracing::warn!(error = %e, "node workspace preparation failed");
    }
    if let Err(e) = prepare_venv(config).await {
        tracing::warn!(error = %e, "venv preparation failed");
    }

    if !node_dependencies.is_empty() {
        let report = install_node(config, node_dependencies).await;
        tracing::info!(
            installed = report.installed.len(),
            failed = report.failed.len(),
            success = report.success,
            "node dependency installation finished"
        );
    }
    if !python_requirements.trim().is_empty() {
        let report = install_python(config, python_requirements).await;
        tracing::info!(
            installed = report.installed.len(),
            failed = report.failed.len(),
            success = report.success,
            "python requirement installation finished"
        );
    }
}

// ============================================================================
// Init script
// ============================================================================

/// Run the user's init script once, bounded by a 5-minute timeout. A blank
/// script is a success. Returns the readiness error string on failure.
pub(crate) async fn run_init_script(config: &Config, script: &str) -> Result<(), String> {
    if script.trim().is_empty() {
        return Ok(());
    }

    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..12];
    let script_path = std::env::temp_dir().join(format!("init-{suffix}.sh"));
    if let Err(e) = tokio::fs::write(&script_path, script).await {
        return Err(format!("failed to write init script: {e}"));
    }
    if let Err(e) = set_executable(&script_path).await {
        let _ = tokio::fs::remove_file(&script_path).await;
        return Err(format!("failed to chmod init script: {e}"));
    }

    let command = format!("bash '{}'", script_path.display());
    let result = runner::run(
        config,
        &command,
        Some(&config.sandbox_root),
        INIT_SCRIPT_TIMEOUT_SECONDS * 1000,
    )
    .await;

    if let Err(e) = tokio::fs::remove_file(&script_path).await {
        tracing::warn!(path = %script_path.display(), error = %e, "init script cleanup failed");
    }

    match result {
        Ok(out) if out.exit_code == 0 => {
            tracing::info!("init script completed");
            Ok(())
        }
        Ok(out) if out.timed_out => Err(format!(
            "init script timed out after {INIT_SCRIPT_TIMEOUT_SECONDS}s"
        )),
        Ok(out) => Err(format!(
            "init script exited with code {}: {}",
            out.exit_code,
            out.stderr.trim()
        )),
        Err(e) => Err(format!("init script failed to run: {e}")),
    }
}

async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> Config {
        Config {
            port: 0,
            web_server_url: String::new(),
            local_mode: true,
            sandbox_root: root.path().to_path_buf(),
            kv_store_id: None,
            api_token: None,
            api_base_url: String::new(),
            events_ws_url: None,
            run_id: None,
        }
    }

    #[rstest]
    #[case("lodash@4.17.21", true)]
    #[case("@types/node@22.0.0", true)]
    #[case("requests==2.31.0", true)]
    #[case("numpy>=1.0,<2.0", true)]
    #[case("pandas[excel]~=2.0", true)]
    #[case("", false)]
    #[case("evil; rm -rf /", false)]
    #[case("../local-path", false)]
    #[case("pkg\\path", false)]
    #[case("pkg`id`", false)]
    #[case("pkg$(id)", false)]
    #[case("-rf", false)]
    fn test_validate_package_spec(#[case] spec: &str, #[case] ok: bool) {
        assert_eq!(validate_package_spec(spec).is_ok(), ok, "{spec}");
    }

    #[test]
    fn test_parse_requirements_skips_blanks_and_comments() {
        let text = "requests==2.31.0\n\n# a comment\n  flask>=3.0  \n#another\n";
        assert_eq!(
            parse_requirements(text),
            vec!["requests==2.31.0".to_string(), "flask>=3.0".to_string()]
        );
    }

    #[test]
    fn test_parse_requirements_empty() {
        assert!(parse_requirements("").is_empty());
        assert!(parse_requirements("\n# only comments\n").is_empty());
    }

    #[tokio::test]
    async fn test_prepare_node_workspace_creates_manifest() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let pre = prepare_node_workspace(&config).await.unwrap();
        assert!(!pre);
        let manifest =
            std::fs::read_to_string(config.js_ts_dir().join("package.json")).unwrap();
        assert!(manifest.contains("\"type\": \"module\""));
        assert!(config.js_ts_dir().join("node_modules").is_dir());
    }

    #[tokio::test]
    async fn test_prepare_node_workspace_detects_preprovisioned() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        prepare_node_workspace(&config).await.unwrap();
        assert!(prepare_node_workspace(&config).await.unwrap());
    }

    #[tokio::test]
    async fn test_prepare_venv_detects_preprovisioned() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        std::fs::create_dir_all(config.venv_dir()).unwrap();
        assert!(prepare_venv(&config).await.unwrap());
    }

    #[tokio::test]
    async fn test_init_script_blank_is_success() {
        let root = TempDir::new().unwrap();
        assert!(run_init_script(&test_config(&root), "  \n ").await.is_ok());
    }

    #[tokio::test]
    async fn test_init_script_success() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        run_init_script(&config, "touch marker.txt").await.unwrap();
        assert!(root.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn test_init_script_failure_reports_exit_code() {
        let root = TempDir::new().unwrap();
        let err = run_init_script(&test_config(&root), "echo broken >&2; exit 7")
            .await
            .unwrap_err();
        assert!(err.contains("code 7"));
        assert!(err.contains("broken"));
    }

    #[tokio::test]
    async fn test_init_script_temp_file_removed() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let count_scripts = || {
            std::fs::read_dir(std::env::temp_dir())
                .unwrap()
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.starts_with("init-") && n.ends_with(".sh"))
                })
                .count()
        };
        let before = count_scripts();
        run_init_script(&config, "true").await.unwrap();
        let _ = run_init_script(&config, "exit 1").await;
        assert_eq!(count_scripts(), before);
    }
}
