//! Process configuration from the orchestrator-injected environment.

use std::path::PathBuf;

use crate::constants::SANDBOX_ROOT;

/// Runtime configuration, resolved once at startup.
///
/// The orchestrator injects `ACTOR_*` variables when it starts the
/// container; everything has a usable default for local runs.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) port: u16,
    pub(crate) web_server_url: String,
    /// `MODE=local`: skip env setup, init script, terminal proxy, migration.
    pub(crate) local_mode: bool,
    pub(crate) sandbox_root: PathBuf,
    pub(crate) kv_store_id: Option<String>,
    pub(crate) api_token: Option<String>,
    pub(crate) api_base_url: String,
    pub(crate) events_ws_url: Option<String>,
    pub(crate) run_id: Option<String>,
}

impl Config {
    pub(crate) fn from_env() -> Self {
        let port = std::env::var("ACTOR_WEB_SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let web_server_url = std::env::var("ACTOR_WEB_SERVER_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));
        Self {
            port,
            web_server_url,
            local_mode: std::env::var("MODE").is_ok_and(|m| m.eq_ignore_ascii_case("local")),
            sandbox_root: PathBuf::from(SANDBOX_ROOT),
            kv_store_id: non_empty_var("ACTOR_DEFAULT_KEY_VALUE_STORE_ID"),
            api_token: non_empty_var("APIFY_TOKEN"),
            api_base_url: std::env::var("APIFY_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.apify.com".to_string()),
            events_ws_url: non_empty_var("ACTOR_EVENTS_WS_URL"),
            run_id: non_empty_var("ACTOR_RUN_ID"),
        }
    }

    /// Absolute path of the Node/TypeScript workspace.
    pub(crate) fn js_ts_dir(&self) -> PathBuf {
        self.sandbox_root.join(crate::constants::JS_TS_WORKSPACE)
    }

    /// Absolute path of the Python workspace.
    pub(crate) fn py_dir(&self) -> PathBuf {
        self.sandbox_root.join(crate::constants::PY_WORKSPACE)
    }

    /// Absolute path of the Python virtual environment.
    pub(crate) fn venv_dir(&self) -> PathBuf {
        self.py_dir().join(crate::constants::VENV_DIR)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// User-supplied sandbox input, fetched from the platform K/V record
/// `INPUT` during startup. Every field is optional.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct SandboxInput {
    pub(crate) node_dependencies: std::collections::HashMap<String, String>,
    pub(crate) python_requirements: String,
    pub(crate) init_script: String,
    pub(crate) idle_timeout_seconds: Option<i64>,
}

// ============================================================================
// Tests
// ============================================================================
