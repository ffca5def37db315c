//! The unified operation error type and shared process helpers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

// ============================================================================
// OpError — the unified error type for request handlers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    /// Bad input: 400.
    Validation,
    /// Missing path: 404.
    NotFound,
    /// Sandbox confinement violation: 400 for writes, 404 for reads.
    PathEscape,
    /// Non-empty directory delete without `recursive`: 409.
    Conflict,
    /// Unexpected failure: 500.
    Internal,
}

/// Error for expected request-path failures. Handlers return these as
/// values; the facade maps them to status codes. Only genuinely unexpected
/// conditions use `internal`.
#[derive(Debug)]
pub(crate) struct OpError {
    pub(crate) kind: ErrorKind,
    pub(crate) message: String,
}

impl OpError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: msg.into(),
        }
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: msg.into(),
        }
    }

    pub(crate) fn path_escape(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PathEscape,
            message: msg.into(),
        }
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: msg.into(),
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: msg.into(),
        }
    }

    /// Read-side mapping: path escapes surface as 404 so probing a path
    /// outside the sandbox is indistinguishable from a missing file.
    pub(crate) fn for_read(self) -> Self {
        match self.kind {
            ErrorKind::PathEscape => Self {
                kind: ErrorKind::NotFound,
                message: self.message,
            },
            _ => self,
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation | ErrorKind::PathEscape => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for OpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl IntoResponse for OpError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message });
        if self.kind == ErrorKind::Conflict {
            body["code"] = json!("DIRECTORY_NOT_EMPTY");
        }
        (self.status(), axum::Json(body)).into_response()
    }
}

// ============================================================================
// Process helpers
// ============================================================================

/// Extract exit code following Unix shell conventions.
///
/// - Normal exit: the exit code (0-255)
/// - Signal kill: 128 + signal number (e.g. SIGKILL -> 137)
/// - Neither: 255 as "unknown error" fallback
pub(crate) fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(255)
}

/// Gracefully terminate a process group: SIGTERM -> wait -> SIGKILL.
pub(crate) async fn graceful_terminate_process_group(
    child: &mut tokio::process::Child,
    grace_period_secs: u64,
) {
    use tokio::time::{Duration, timeout};

    let pid = match child.id() {
        Some(id) => id as i32,
        None => return, // already exited
    };

    let term_result = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if term_result == -1 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, %errno, "SIGTERM to process group failed");
        }
        let _ = child.wait().await;
        return;
    }

    match timeout(Duration::from_secs(grace_period_secs), child.wait()).await {
        Ok(Ok(_)) => return,
        Ok(Err(e)) => tracing::warn!(pid, error = %e, "wait error after SIGTERM"),
        Err(_) => tracing::warn!(
            pid,
            grace_period_secs,
            "child ignored SIGTERM, sending SIGKILL"
        ),
    }

    let kill_result = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if kill_result == -1 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, %errno, "SIGKILL to process group failed");
        }
    }

    let _ = child.wait().await;
}

/// Spawn a task that reads a child stream to the end, capped at `max_bytes`.
/// The cap truncates silently; the child keeps draining so it never blocks
/// on a full pipe.
pub(crate) fn spawn_capped_reader<R: tokio::io::AsyncRead + Unpin + Send + 'static>(
    stream: R,
    max_bytes: usize,
) -> tokio::task::JoinHandle<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    tokio::spawn(async move {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut stream = stream;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = max_bytes.saturating_sub(out.len());
                    if room > 0 {
                        out.extend_from_slice(&buf[..n.min(room)]);
                    }
                }
            }
        }
        out
    })
}

// ============================================================================
// Tests
// ============================================================================
