//! Startup orchestration: restore or install, run the init script, flip
//! readiness, then register the migration handler.
//!
//! ```text
//! INIT -> (restore? RESTORED : INSTALLING -> INSTALLED) -> INIT_SCRIPT -> READY
//!                                                                    \-> READY-BUT-UNHEALTHY
//! ```

use crate::config::SandboxInput;
use crate::constants::KV_KEY_INPUT;
use crate::migration;
use crate::setup;
use crate::state::SharedState;

/// Drive the whole startup sequence. Requests are admitted throughout;
/// `/health` reports `initializing` until this completes.
pub(crate) async fn start(state: SharedState) {
    if state.config.local_mode {
        tracing::info!("local mode: skipping environment setup, init script and migration");
        state.mark_ready(None);
        return;
    }

    let input = fetch_input(&state).await;
    if let Some(timeout) = input.idle_timeout_seconds {
        state.set_idle_timeout(timeout);
    }

    let restored = migration::restore_migration_state(&state).await;
    if restored {
        tracing::info!("environment restored from migration checkpoint");
    } else {
        setup::setup_execution_environment(
            &state.config,
            &input.node_dependencies,
            &input.python_requirements,
        )
        .await;
    }

    let init_error = setup::run_init_script(&state.config, &input.init_script)
        .await
        .err();
    if let Some(msg) = &init_error {
        tracing::error!(error = %msg, "init script failed, service will report unhealthy");
    }

    // The marker is only laid down on fresh starts: restored files carry
    // extraction-time mtimes and stay in the next checkpoint's delta.
    if !restored {
        migration::write_startup_marker().await;
    }

    state.mark_ready(init_error);
    tracing::info!(restored, "startup complete, accepting traffic");

    tokio::spawn(migration::run_events_listener(state.clone()));
}

/// Sandbox input from the platform K/V record `INPUT`. Every failure path
/// degrades to defaults; input is optional by contract.
async fn fetch_input(state: &SharedState) -> SandboxInput {
    let Some(kv) = &state.kv else {
        return SandboxInput::default();
    };
    match kv.get_json::<SandboxInput>(KV_KEY_INPUT).await {
        Ok(Some(input)) => input,
        Ok(None) => SandboxInput::default(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch sandbox input, using defaults");
            SandboxInput::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
