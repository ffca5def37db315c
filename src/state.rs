//! Process-wide shared state: readiness, activity tracking, idle shutdown.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::Config;
use crate::constants::{DEFAULT_IDLE_TIMEOUT_SECONDS, IDLE_CHECK_INTERVAL_SECONDS};
use crate::kv::KvClient;

pub(crate) type SharedState = Arc<AppState>;

pub(crate) struct AppState {
    pub(crate) config: Config,
    pub(crate) kv: Option<KvClient>,
    started: Instant,
    /// Wall-clock start time (unix seconds), recorded in migration manifests
    /// and used as the changed-file cutoff when no startup marker exists.
    pub(crate) started_at_unix: i64,
    // Readiness is monotone: set once by the lifecycle controller.
    ready: AtomicBool,
    readiness_error: RwLock<Option<String>>,
    // Milliseconds since `started`; racy last-writer-wins is fine.
    last_activity_ms: AtomicU64,
    idle_timeout_secs: AtomicI64,
}

impl AppState {
    pub(crate) fn new(config: Config) -> SharedState {
        let kv = KvClient::from_config(&config);
        Arc::new(Self {
            config,
            kv,
            started: Instant::now(),
            started_at_unix: chrono::Utc::now().timestamp(),
            ready: AtomicBool::new(false),
            readiness_error: RwLock::new(None),
            last_activity_ms: AtomicU64::new(0),
            idle_timeout_secs: AtomicI64::new(DEFAULT_IDLE_TIMEOUT_SECONDS),
        })
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    /// Mark startup complete, with an error string when the init script
    /// failed. Called exactly once by the lifecycle controller.
    pub(crate) fn mark_ready(&self, error: Option<String>) {
        if let Some(msg) = error {
            *self.readiness_error.write().unwrap() = Some(msg);
        }
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn readiness_error(&self) -> Option<String> {
        self.readiness_error.read().unwrap().clone()
    }

    // ------------------------------------------------------------------
    // Activity
    // ------------------------------------------------------------------

    pub(crate) fn touch_activity(&self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub(crate) fn idle_secs(&self) -> u64 {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        now_ms.saturating_sub(last) / 1000
    }

    pub(crate) fn set_idle_timeout(&self, secs: i64) {
        self.idle_timeout_secs.store(secs, Ordering::Relaxed);
    }

    pub(crate) fn idle_timeout_secs(&self) -> i64 {
        self.idle_timeout_secs.load(Ordering::Relaxed)
    }

    /// True when the idle monitor should shut the container down.
    /// A non-positive timeout disables the monitor entirely.
    pub(crate) fn idle_deadline_passed(&self) -> bool {
        let timeout = self.idle_timeout_secs();
        timeout > 0 && self.idle_secs() > timeout as u64
    }
}

/// Background sweep: every 30 s, exit gracefully once the idle deadline has
/// passed. The orchestrator treats exit code 0 as a normal finish.
pub(crate) async fn run_idle_monitor(state: SharedState) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(IDLE_CHECK_INTERVAL_SECONDS));
    interval.tick().await; // first tick fires immediately
    loop {
        interval.tick().await;
        if state.idle_deadline_passed() {
            tracing::info!(
                idle_secs = state.idle_secs(),
                timeout_secs = state.idle_timeout_secs(),
                "no activity within the idle timeout, shutting down"
            );
            std::process::exit(0);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
