//! Constants shared across the sandbox service.

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sandbox root. All user-visible paths resolve under this directory.
pub(crate) const SANDBOX_ROOT: &str = "/sandbox";

// Per-language workspaces (relative to the sandbox root).
pub(crate) const JS_TS_WORKSPACE: &str = "js-ts";
pub(crate) const PY_WORKSPACE: &str = "py";
pub(crate) const VENV_DIR: &str = "venv";

// Execution limits
pub(crate) const MAX_TIMEOUT_SECONDS: u64 = 300; // 5 minutes max execution timeout
pub(crate) const DEFAULT_EXEC_TIMEOUT_SECONDS: u64 = 60;
pub(crate) const MAX_EXEC_OUTPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB per stream
pub(crate) const TERM_GRACE_PERIOD_SECONDS: u64 = 5; // SIGTERM -> SIGKILL grace
pub(crate) const TIMEOUT_EXIT_CODE: i32 = 124;

// Body limits
pub(crate) const MAX_FS_BODY_BYTES: usize = 500 * 1024 * 1024; // 500 MiB raw /fs uploads
pub(crate) const MAX_JSON_BODY_BYTES: usize = 50 * 1024 * 1024; // 50 MiB JSON elsewhere

// Environment setup
pub(crate) const PACKAGE_INSTALL_TIMEOUT_SECONDS: u64 = 120; // per package/requirement
pub(crate) const INIT_SCRIPT_TIMEOUT_SECONDS: u64 = 300;

// Terminal proxy
pub(crate) const TTYD_PORT: u16 = 7681;
pub(crate) const TTYD_RESPAWN_DELAY_SECONDS: u64 = 5;
pub(crate) const SHELL_RC_FILE: &str = ".sandboxrc";

// Idle shutdown
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECONDS: i64 = 600;
pub(crate) const IDLE_CHECK_INTERVAL_SECONDS: u64 = 30;

// Migration persistence
pub(crate) const KV_KEY_MANIFEST: &str = "migration-manifest";
pub(crate) const KV_KEY_TARBALL: &str = "migration-tarball";
pub(crate) const KV_KEY_INPUT: &str = "INPUT";
pub(crate) const STARTUP_MARKER_PATH: &str = "/tmp/.sandboxd-startup-marker";
pub(crate) const PIP_BASELINE_PATH: &str = "/opt/sandbox/pip-baseline.txt";
pub(crate) const APT_HISTORY_LOG: &str = "/var/log/apt/history.log";
pub(crate) const RESTORE_INSTALL_TIMEOUT_SECONDS: u64 = 300;

/// Directory prefixes never included in a migration snapshot: virtual
/// filesystems, caches, and regenerable state. The dpkg DB is excluded
/// because OS packages are re-installed from apt history instead.
pub(crate) const SNAPSHOT_EXCLUDED_PREFIXES: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/tmp",
    "/var/cache/apt",
    "/var/lib/apt/lists",
    "/var/lib/dpkg",
];

// Readiness probe header set by the orchestrator; requests carrying it do
// not count as user activity.
pub(crate) const READINESS_PROBE_HEADER: &str = "x-apify-container-server-readiness-probe";
