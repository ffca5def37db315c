//! Migration persistence: snapshot the user's delta (changed files plus
//! installed packages) when the platform signals a live migration, and
//! restore it before admitting requests on the next start.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::constants::*;
use crate::runner;
use crate::state::{AppState, SharedState};
use crate::types::{ChangedFiles, MigrationManifest, PackageSnapshot};

// ============================================================================
// Startup marker
// ============================================================================

/// Zero-byte marker whose mtime is the changed-file cutoff. Written at boot
/// end on non-restored starts only; after a restore the extracted files'
/// fresh mtimes keep them in later deltas.
pub(crate) async fn write_startup_marker() {
    if let Err(e) = tokio::fs::write(STARTUP_MARKER_PATH, b"").await {
        tracing::warn!(error = %e, "failed to write startup marker");
    }
}

fn marker_mtime() -> Option<SystemTime> {
    std::fs::metadata(STARTUP_MARKER_PATH)
        .and_then(|m| m.modified())
        .ok()
}

// ============================================================================
// Changed-file scan
// ============================================================================

/// Walk `scan_root` for regular files modified after `cutoff`, staying on
/// `device` (when given) and skipping `excluded` subtrees. Symlinks are not
/// followed.
pub(crate) fn scan_changed_files(
    scan_root: &Path,
    excluded: &[PathBuf],
    cutoff: SystemTime,
    device: Option<u64>,
) -> ChangedFiles {
    use std::os::unix::fs::MetadataExt;

    let mut out = ChangedFiles::default();
    let mut stack = vec![scan_root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue, // unreadable directories are skipped, not fatal
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if excluded.iter().any(|ex| path.starts_with(ex)) {
                continue;
            }
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if let Some(dev) = device {
                if meta.dev() != dev {
                    continue;
                }
            }
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                let newer = meta.modified().map(|m| m > cutoff).unwrap_or(false);
                if newer {
                    out.count += 1;
                    out.total_size += meta.len();
                    out.paths.push(path.to_string_lossy().into_owned());
                }
            }
        }
    }

    out.paths.sort();
    out
}

async fn find_changed_files(state: &AppState) -> ChangedFiles {
    use std::os::unix::fs::MetadataExt;

    let cutoff = marker_mtime().unwrap_or_else(|| {
        // No marker (first boot was restored): fall back to this boot's
        // start time so at least the current session's writes are captured.
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(state.started_at_unix.max(0) as u64)
    });

    let mut excluded: Vec<PathBuf> = SNAPSHOT_EXCLUDED_PREFIXES
        .iter()
        .map(PathBuf::from)
        .collect();
    excluded.push(state.config.js_ts_dir().join("node_modules"));
    excluded.push(state.config.venv_dir());

    let device = std::fs::metadata("/").map(|m| m.dev()).ok();

    tokio::task::spawn_blocking(move || {
        scan_changed_files(Path::new("/"), &excluded, cutoff, device)
    })
    .await
    .unwrap_or_default()
}

// ============================================================================
// Package snapshot
// ============================================================================

/// Package names from the `Install:` lines of apt's history log.
/// Approximate by design: dependencies pulled in implicitly appear too, and
/// removals are not tracked; restore is additive either way.
pub(crate) fn parse_apt_history(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("Install:") else {
            continue;
        };
        // "jq:amd64 (1.6-2.1), libjq1:amd64 (1.6-2.1, automatic), ..."
        for chunk in rest.split("), ") {
            let chunk = chunk.trim().trim_end_matches(')');
            if chunk.is_empty() {
                continue;
            }
            let name = chunk
                .split([':', ' ', '('])
                .next()
                .unwrap_or_default()
                .trim();
            if !name.is_empty() && seen.insert(name.to_string()) {
                out.push(name.to_string());
            }
        }
    }
    out
}

/// Lines of `current` freeze output missing from the image-time `baseline`.
pub(crate) fn diff_freeze(current: &str, baseline: &str) -> Vec<String> {
    let base: HashSet<&str> = baseline
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    current
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !base.contains(l))
        .map(String::from)
        .collect()
}

async fn snapshot_packages(state: &AppState) -> PackageSnapshot {
    let apt = match tokio::fs::read_to_string(APT_HISTORY_LOG).await {
        Ok(text) => parse_apt_history(&text),
        Err(_) => Vec::new(),
    };

    let pip_cmd = format!("'{}' freeze", state.config.venv_dir().join("bin/pip").display());
    let pip = match runner::run(&state.config, &pip_cmd, None, 60_000).await {
        Ok(out) if out.exit_code == 0 => {
            let baseline = tokio::fs::read_to_string(PIP_BASELINE_PATH)
                .await
                .unwrap_or_default();
            diff_freeze(&out.stdout, &baseline)
        }
        Ok(out) => {
            tracing::warn!(exit_code = out.exit_code, "pip freeze failed during snapshot");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "pip freeze could not run during snapshot");
            Vec::new()
        }
    };

    PackageSnapshot { apt, pip }
}

// ============================================================================
// Tarball
// ============================================================================

/// Gzipped POSIX tar of the given absolute paths, stored with the leading
/// `/` stripped so extraction at `/` restores them in place. Permissions
/// and ownership ride in the tar headers. Empty input yields an empty (but
/// valid) archive.
pub(crate) fn build_tarball(paths: &[String]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for path in paths {
        let name = path.trim_start_matches('/');
        if let Err(e) = builder.append_path_with_name(path, name) {
            // Files can vanish between scan and archive time.
            tracing::warn!(path, error = %e, "skipping file while building tarball");
        }
    }

    let encoder = builder.into_inner().context("finalizing tar stream")?;
    encoder.finish().context("finalizing gzip stream")
}

/// Extract a checkpoint tarball at `root`, overwriting on conflict (last
/// writer wins; the restore is strictly additive to the base image).
pub(crate) fn extract_tarball(bytes: &[u8], root: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    // chown requires root; skip ownership restore in unprivileged runs.
    archive.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);
    archive.unpack(root).context("extracting migration tarball")
}

// ============================================================================
// Checkpoint
// ============================================================================

static CHECKPOINT_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

/// Snapshot everything to the external K/V. Never returns an error: the
/// platform is about to stop the container and nothing may block that.
pub(crate) async fn checkpoint(state: &AppState) {
    let Some(kv) = &state.kv else {
        tracing::warn!("migration signalled but no K/V store is configured, skipping checkpoint");
        return;
    };
    if CHECKPOINT_IN_FLIGHT.swap(true, Ordering::SeqCst) {
        tracing::warn!("checkpoint already in flight, ignoring duplicate signal");
        return;
    }

    tracing::info!("migration checkpoint starting");
    let (changed_files, packages) =
        tokio::join!(find_changed_files(state), snapshot_packages(state));
    tracing::info!(
        files = changed_files.count,
        total_size = changed_files.total_size,
        apt = packages.apt.len(),
        pip = packages.pip.len(),
        "migration delta computed"
    );

    let manifest = MigrationManifest {
        version: 1,
        created_at: chrono::Utc::now().to_rfc3339(),
        run_id: state.config.run_id.clone(),
        startup_timestamp: state.started_at_unix,
        packages,
        changed_files: changed_files.clone(),
    };

    let paths = changed_files.paths;
    let tarball = match tokio::task::spawn_blocking(move || build_tarball(&paths)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "tarball build failed, aborting checkpoint");
            CHECKPOINT_IN_FLIGHT.store(false, Ordering::SeqCst);
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "tarball task failed, aborting checkpoint");
            CHECKPOINT_IN_FLIGHT.store(false, Ordering::SeqCst);
            return;
        }
    };

    // Tarball first: a manifest must never reference a missing tarball.
    if let Err(e) = kv
        .put_record(KV_KEY_TARBALL, tarball, "application/gzip")
        .await
    {
        tracing::error!(error = %e, "tarball upload failed, aborting checkpoint");
        CHECKPOINT_IN_FLIGHT.store(false, Ordering::SeqCst);
        return;
    }
    match serde_json::to_vec(&manifest) {
        Ok(json) => {
            if let Err(e) = kv.put_record(KV_KEY_MANIFEST, json, "application/json").await {
                tracing::error!(error = %e, "manifest upload failed");
            } else {
                tracing::info!("migration checkpoint uploaded");
            }
        }
        Err(e) => tracing::error!(error = %e, "manifest serialization failed"),
    }
    CHECKPOINT_IN_FLIGHT.store(false, Ordering::SeqCst);
}

// ============================================================================
// Restore
// ============================================================================

/// Restore a prior checkpoint if one exists. Returns true when state was
/// restored (the controller then skips environment setup). Any failure
/// logs and returns false so the service still boots from the base image.
pub(crate) async fn restore_migration_state(state: &AppState) -> bool {
    let Some(kv) = &state.kv else { return false };

    let manifest: MigrationManifest = match kv.get_json(KV_KEY_MANIFEST).await {
        Ok(Some(m)) => m,
        Ok(None) => {
            tracing::info!("no migration manifest found, fresh start");
            return false;
        }
        Err(e) => {
            tracing::warn!(error = %e, "manifest fetch failed, booting from base image");
            return false;
        }
    };
    if manifest.version != 1 {
        tracing::warn!(
            version = manifest.version,
            "unknown manifest version, booting from base image"
        );
        return false;
    }
    tracing::info!(
        created_at = %manifest.created_at,
        files = manifest.changed_files.count,
        "migration manifest found, restoring"
    );

    // An empty delta means an empty tarball; skip extraction entirely.
    if manifest.changed_files.count > 0 {
        let tarball = match kv.get_record(KV_KEY_TARBALL).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!("manifest present but tarball missing, booting from base image");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "tarball download failed, booting from base image");
                return false;
            }
        };
        let extract = tokio::task::spawn_blocking(move || extract_tarball(&tarball, Path::new("/")))
            .await;
        match extract {
            Ok(Ok(())) => tracing::info!(files = manifest.changed_files.count, "files restored"),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "tarball extraction failed, booting from base image");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "extraction task failed, booting from base image");
                return false;
            }
        }
    }

    restore_packages(state, &manifest.packages).await;
    true
}

/// Re-install snapshotted packages. Failures are logged and skipped: a
/// partially restored environment still beats none.
async fn restore_packages(state: &AppState, packages: &PackageSnapshot) {
    let config = &state.config;

    if !packages.apt.is_empty() {
        let list = packages.apt.join(" ");
        let command = format!(
            "apt-get update -qq && apt-get install -y --no-install-recommends {list}"
        );
        match runner::run(config, &command, None, RESTORE_INSTALL_TIMEOUT_SECONDS * 1000).await {
            Ok(out) if out.exit_code == 0 => {
                tracing::info!(count = packages.apt.len(), "OS packages restored");
            }
            Ok(out) => tracing::warn!(
                exit_code = out.exit_code,
                stderr = %out.stderr.trim(),
                "OS package restore failed"
            ),
            Err(e) => tracing::warn!(error = %e, "OS package restore could not run"),
        }
    }

    if !packages.pip.is_empty() {
        let reqs_path = std::env::temp_dir().join("restore-requirements.txt");
        if let Err(e) = tokio::fs::write(&reqs_path, packages.pip.join("\n")).await {
            tracing::warn!(error = %e, "could not write restore requirements file");
        } else {
            let command = format!(
                "'{}' install -r '{}'",
                config.venv_dir().join("bin/pip").display(),
                reqs_path.display()
            );
            match runner::run(config, &command, None, RESTORE_INSTALL_TIMEOUT_SECONDS * 1000).await
            {
                Ok(out) if out.exit_code == 0 => {
                    tracing::info!(count = packages.pip.len(), "python packages restored");
                }
                Ok(out) => tracing::warn!(
                    exit_code = out.exit_code,
                    stderr = %out.stderr.trim(),
                    "python package restore failed"
                ),
                Err(e) => tracing::warn!(error = %e, "python package restore could not run"),
            }
            let _ = tokio::fs::remove_file(&reqs_path).await;
        }
    }

    // Node packages were not listed in the manifest: the restored
    // package.json is the source of truth and npm re-resolves it.
    let manifest_path = config.js_ts_dir().join("package.json");
    if manifest_path.exists() {
        let cwd = config.js_ts_dir();
        match runner::run(
            config,
            "npm install --no-audit --no-fund",
            Some(&cwd),
            RESTORE_INSTALL_TIMEOUT_SECONDS * 1000,
        )
        .await
        {
            Ok(out) if out.exit_code == 0 => tracing::info!("node packages restored"),
            Ok(out) => tracing::warn!(
                exit_code = out.exit_code,
                stderr = %out.stderr.trim(),
                "node package restore failed"
            ),
            Err(e) => tracing::warn!(error = %e, "node package restore could not run"),
        }
    }
}

// ============================================================================
// Platform events
// ============================================================================

/// Listen on the orchestrator's events WebSocket for the `migrating`
/// signal. Reconnects with a fixed delay; gives up only with the process.
pub(crate) async fn run_events_listener(state: SharedState) {
    use futures_util::StreamExt;

    let Some(url) = state.config.events_ws_url.clone() else {
        tracing::info!("no events WebSocket configured, migration signal disabled");
        return;
    };

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                tracing::info!("connected to platform events");
                while let Some(message) = ws.next().await {
                    let text = match message {
                        Ok(m) if m.is_text() => match m.into_text() {
                            Ok(t) => t,
                            Err(_) => continue,
                        },
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "events socket error");
                            break;
                        }
                    };
                    match serde_json::from_str::<crate::types::PlatformEvent>(text.as_str()) {
                        Ok(event) if event.name == "migrating" => {
                            tracing::info!("platform signalled migration");
                            checkpoint(&state).await;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "unparseable platform event"),
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "events connection failed"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
