//! HTTP facade: routing, body discipline, health gating, activity stamping.

use std::collections::HashMap;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::constants::*;
use crate::error::OpError;
use crate::executor;
use crate::fsops;
use crate::mcp;
use crate::paths;
use crate::shell;
use crate::state::SharedState;
use crate::types::*;

pub(crate) fn build_router(state: SharedState) -> Router {
    // /fs carries raw bodies up to 500 MiB; everything else parses JSON
    // bounded at 50 MiB.
    let fs_routes = Router::new()
        .route("/fs", any(fs_root_entry))
        .route("/fs/", any(fs_root_entry))
        .route("/fs/{*path}", any(fs_entry))
        .layer(DefaultBodyLimit::max(MAX_FS_BODY_BYTES));

    let api_routes = Router::new()
        .route("/", get(landing_page))
        .route("/llms.txt", get(llms_txt))
        .route("/health", get(health))
        .route("/exec", post(exec))
        .route("/mcp", any(mcp::mcp_entry))
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_BYTES));

    let shell_routes = Router::new()
        .route("/shell", any(shell::proxy_entry))
        .route("/shell/{*path}", any(shell::proxy_entry));

    Router::new()
        .merge(fs_routes)
        .merge(api_routes)
        .merge(shell_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_activity,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp user activity for every request except `/health` and the
/// orchestrator's readiness probes.
async fn track_activity(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let is_probe = request.headers().contains_key(READINESS_PROBE_HEADER);
    if request.uri().path() != "/health" && !is_probe {
        state.touch_activity();
    }
    next.run(request).await
}

// ============================================================================
// Health and static pages
// ============================================================================

async fn health(State(state): State<SharedState>) -> Response {
    if !state.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "initializing" })),
        )
            .into_response();
    }
    if let Some(message) = state.readiness_error() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "message": message })),
        )
            .into_response();
    }
    Json(json!({ "status": "healthy" })).into_response()
}

async fn landing_page(State(state): State<SharedState>) -> Response {
    let html = format!(
        include_str!("landing.html"),
        url = state.config.web_server_url,
        version = VERSION
    );
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

async fn llms_txt(State(state): State<SharedState>) -> Response {
    let text = format!(include_str!("llms.txt"), url = state.config.web_server_url);
    ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], text).into_response()
}

// ============================================================================
// Execution
// ============================================================================

async fn exec(
    State(state): State<SharedState>,
    Json(req): Json<ExecRequest>,
) -> Result<Response, OpError> {
    if req.command.trim().is_empty() {
        return Err(OpError::validation("missing required field: command"));
    }
    let lang = Language::parse(req.language.as_deref()).ok_or_else(|| {
        OpError::validation(format!(
            "invalid language '{}' (expected shell, js, ts or py)",
            req.language.as_deref().unwrap_or_default()
        ))
    })?;

    let result = executor::execute_request(
        &state.config,
        &req.command,
        lang,
        req.cwd.as_deref(),
        req.timeout_secs,
    )
    .await?;

    // A failed child is reported with the full result body, not an error
    // envelope.
    let status = if result.exit_code == 0 {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)).into_response())
}

// ============================================================================
// Filesystem endpoints
// ============================================================================

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params
        .get(name)
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

async fn fs_root_entry(
    state: State<SharedState>,
    params: Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    fs_dispatch(state, String::new(), params, request).await
}

async fn fs_entry(
    state: State<SharedState>,
    UrlPath(path): UrlPath<String>,
    params: Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    fs_dispatch(state, path, params, request).await
}

async fn fs_dispatch(
    State(state): State<SharedState>,
    path: String,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    if method == axum::http::Method::GET {
        fs_get(&state, &path, &params)
            .await
            .unwrap_or_else(|e| e.for_read().into_response())
    } else if method == axum::http::Method::HEAD {
        fs_head(&state, &path)
            .await
            .unwrap_or_else(|e| e.for_read().into_response())
    } else if method == axum::http::Method::PUT {
        let body = match read_body(request).await {
            Ok(b) => b,
            Err(e) => return e.into_response(),
        };
        fs_put(&state, &path, &params, body)
            .await
            .unwrap_or_else(|e| e.into_response())
    } else if method == axum::http::Method::POST {
        let body = match read_body(request).await {
            Ok(b) => b,
            Err(e) => return e.into_response(),
        };
        fs_post(&state, &path, &params, body)
            .await
            .unwrap_or_else(|e| e.into_response())
    } else if method == axum::http::Method::DELETE {
        fs_delete(&state, &path, &params)
            .await
            .unwrap_or_else(|e| e.into_response())
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

async fn read_body(request: Request) -> Result<Bytes, OpError> {
    axum::body::to_bytes(request.into_body(), MAX_FS_BODY_BYTES)
        .await
        .map_err(|e| OpError::validation(format!("unreadable request body: {e}")))
}

async fn fs_get(
    state: &SharedState,
    path: &str,
    params: &HashMap<String, String>,
) -> Result<Response, OpError> {
    let root = &state.config.sandbox_root;
    let resolved = paths::resolve_existing(root, path)?;
    let info = fsops::stat(&resolved).await;
    let download = flag(params, "download");

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());
    if info.is_dir {
        if download {
            let leaf = resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|_| resolved != canonical_root)
                .unwrap_or_else(|| "sandbox".to_string());
            let bytes = fsops::zip_dir(&resolved).await?;
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, "application/zip".parse().unwrap());
            if let Ok(value) = format!("attachment; filename=\"{leaf}.zip\"").parse() {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            return Ok((headers, bytes).into_response());
        }
        let entries = fsops::list_detailed(&resolved).await?;
        return Ok(Json(DirListing {
            path: resolved.display().to_string(),
            entry_type: "directory",
            entries,
        })
        .into_response());
    }

    let bytes = fsops::read_bytes(&resolved).await?;
    let mime = fsops::mime_for_path(&resolved);
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, mime.parse().unwrap());
    if download {
        let leaf = resolved
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        if let Ok(value) = format!("attachment; filename=\"{leaf}\"").parse() {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok((headers, bytes).into_response())
}

async fn fs_head(state: &SharedState, path: &str) -> Result<Response, OpError> {
    let resolved = paths::resolve_existing(&state.config.sandbox_root, path)?;
    let info = fsops::stat(&resolved).await;

    let mut headers = HeaderMap::new();
    let file_type = if info.is_dir { "directory" } else { "file" };
    headers.insert("X-File-Type", file_type.parse().unwrap());
    if let Ok(value) = resolved.display().to_string().parse() {
        headers.insert("X-Path", value);
    }
    if let Some(mtime) = info.mtime {
        let stamp = chrono::DateTime::<chrono::Utc>::from(mtime).to_rfc2822();
        if let Ok(value) = stamp.parse() {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if !info.is_dir {
        headers.insert(
            header::CONTENT_TYPE,
            fsops::mime_for_path(&resolved).parse().unwrap(),
        );
        headers.insert(header::CONTENT_LENGTH, info.size.into());
    }
    Ok((StatusCode::OK, headers).into_response())
}

async fn fs_put(
    state: &SharedState,
    path: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response, OpError> {
    let root = &state.config.sandbox_root;
    let resolved = paths::resolve(root, path)?;
    if resolved == root.canonicalize().unwrap_or_else(|_| root.clone()) {
        return Err(OpError::validation("cannot write to the sandbox root"));
    }
    if body.is_empty() {
        return Err(OpError::validation("request body is empty"));
    }
    let mode = params
        .get("mode")
        .and_then(|m| u32::from_str_radix(m, 8).ok());

    let size = fsops::write_bytes(&resolved, &body, mode).await?;
    Ok(Json(WriteResponse {
        success: true,
        path: resolved.display().to_string(),
        size,
    })
    .into_response())
}

async fn fs_post(
    state: &SharedState,
    path: &str,
    params: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response, OpError> {
    let root = &state.config.sandbox_root;
    let mkdir = flag(params, "mkdir");
    let append = flag(params, "append");

    if mkdir && append {
        return Err(OpError::validation(
            "mkdir and append are mutually exclusive",
        ));
    }
    if !mkdir && !append {
        return Err(OpError::validation(
            "POST requires either ?mkdir=1 or ?append=1",
        ));
    }

    let resolved = paths::resolve(root, path)?;
    if resolved == root.canonicalize().unwrap_or_else(|_| root.clone()) {
        return Err(OpError::validation("cannot modify the sandbox root"));
    }

    if mkdir {
        fsops::mkdir(&resolved).await?;
        return Ok((
            StatusCode::CREATED,
            Json(MkdirResponse {
                success: true,
                path: resolved.display().to_string(),
                entry_type: "directory",
            }),
        )
            .into_response());
    }

    if body.is_empty() {
        return Err(OpError::validation("append requires a request body"));
    }
    let size = fsops::append_bytes(&resolved, &body).await?;
    Ok(Json(WriteResponse {
        success: true,
        path: resolved.display().to_string(),
        size,
    })
    .into_response())
}

async fn fs_delete(
    state: &SharedState,
    path: &str,
    params: &HashMap<String, String>,
) -> Result<Response, OpError> {
    let root = &state.config.sandbox_root;
    let resolved = paths::resolve(root, path)?;
    if resolved == root.canonicalize().unwrap_or_else(|_| root.clone()) {
        return Err(OpError::validation("cannot delete the sandbox root"));
    }

    let recursive = flag(params, "recursive");
    fsops::delete(&resolved, recursive).await.map_err(|e| {
        // Deleting something that is already gone is an internal-class
        // failure on this endpoint, not a 404.
        match e.kind {
            crate::error::ErrorKind::NotFound => OpError::internal(e.message),
            _ => e,
        }
    })?;

    Ok(Json(DeleteResponse {
        success: true,
        path: resolved.display().to_string(),
        deleted: true,
    })
    .into_response())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(root: &TempDir) -> SharedState {
        AppState::new(Config {
            port: 0,
            web_server_url: "http://localhost:0".into(),
            local_mode: true,
            sandbox_root: root.path().to_path_buf(),
            kv_store_id: None,
            api_token: None,
            api_base_url: String::new(),
            events_ws_url: None,
            run_id: None,
        })
    }

    async fn send(router: &Router, request: HttpRequest<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn json_of(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    // -------------------------------------------------------------------------
    // Health gate
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_health_initializing_until_ready() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let router = build_router(state.clone());

        let (status, body) = send(
            &router,
            HttpRequest::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_of(&body)["status"], "initializing");

        state.mark_ready(None);
        let (status, body) = send(
            &router,
            HttpRequest::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["status"], "healthy");
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_init_failed() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        state.mark_ready(Some("init script exited with code 1".into()));
        let router = build_router(state);

        let (status, body) = send(
            &router,
            HttpRequest::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json = json_of(&body);
        assert_eq!(json["status"], "unhealthy");
        assert!(json["message"].as_str().unwrap().contains("init script"));
    }

    #[tokio::test]
    async fn test_other_endpoints_serve_before_ready() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, _) = send(
            &router,
            HttpRequest::get("/fs").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // -------------------------------------------------------------------------
    // Activity tracking
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_health_and_probes_do_not_reset_idle() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let router = build_router(state.clone());

        // Start "idle" by backdating: the fresh state has activity at t=0.
        send(
            &router,
            HttpRequest::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        send(
            &router,
            HttpRequest::get("/fs")
                .header(READINESS_PROBE_HEADER, "1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let idle_after_probe = state.idle_secs();

        send(
            &router,
            HttpRequest::get("/fs").body(Body::empty()).unwrap(),
        )
        .await;
        assert!(state.idle_secs() <= idle_after_probe);
    }

    // -------------------------------------------------------------------------
    // Static pages
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_landing_page_and_llms_txt() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));

        let (status, body) = send(&router, HttpRequest::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("Code Sandbox"));

        let (status, body) = send(
            &router,
            HttpRequest::get("/llms.txt").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("POST /exec"));
    }

    // -------------------------------------------------------------------------
    // /exec
    // -------------------------------------------------------------------------

    fn exec_request(body: &str) -> HttpRequest<Body> {
        HttpRequest::post("/exec")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_exec_shell_success() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, body) = send(&router, exec_request(r#"{"command":"echo hi"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["stdout"], "hi\n");
        assert_eq!(json["stderr"], "");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["language"], "shell");
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_500_with_result_body() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, body) = send(&router, exec_request(r#"{"command":"exit 1"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_of(&body);
        assert_eq!(json["exitCode"], 1);
        assert_eq!(json["stdout"], "");
        assert_eq!(json["language"], "shell");
    }

    #[tokio::test]
    async fn test_exec_missing_command_is_400() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, _) = send(&router, exec_request(r#"{"command":"  "}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&router, exec_request(r#"{}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exec_invalid_language_is_400() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, body) = send(
            &router,
            exec_request(r#"{"command":"x","language":"cobol"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_of(&body)["error"].as_str().unwrap().contains("cobol"));
    }

    #[tokio::test]
    async fn test_exec_language_alias_normalized() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (_, body) = send(
            &router,
            exec_request(r#"{"command":"echo ok","language":"bash"}"#),
        )
        .await;
        assert_eq!(json_of(&body)["language"], "shell");
    }

    #[tokio::test]
    async fn test_exec_cwd_escape_is_500_with_sandbox_error() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, body) = send(
            &router,
            exec_request(r#"{"command":"echo x","cwd":"../.."}"#),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_of(&body);
        assert_eq!(json["exitCode"], 1);
        assert!(json["stderr"].as_str().unwrap().contains("sandbox escape"));
    }

    // -------------------------------------------------------------------------
    // /fs
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fs_put_then_get_roundtrip() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));

        let (status, body) = send(
            &router,
            HttpRequest::put("/fs/a/b/c.txt")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["success"], true);
        assert_eq!(json["size"], 5);
        assert!(json["path"].as_str().unwrap().ends_with("/a/b/c.txt"));

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/fs/a/b/c.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_fs_get_missing_is_404() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, _) = send(
            &router,
            HttpRequest::get("/fs/missing.txt").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fs_escape_reads_are_404_writes_400() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, _) = send(
            &router,
            HttpRequest::get("/fs/..%2f..%2fetc%2fpasswd")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &router,
            HttpRequest::put("/fs/..%2fescape.txt")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fs_put_root_and_empty_body_rejected() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, _) = send(
            &router,
            HttpRequest::put("/fs").body(Body::from("x")).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &router,
            HttpRequest::put("/fs/empty.txt").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fs_mkdir_idempotent_201() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        for _ in 0..2 {
            let (status, body) = send(
                &router,
                HttpRequest::post("/fs/d?mkdir=1").body(Body::empty()).unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(json_of(&body)["type"], "directory");
        }
    }

    #[tokio::test]
    async fn test_fs_post_flag_discipline() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));

        let (status, _) = send(
            &router,
            HttpRequest::post("/fs/x").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &router,
            HttpRequest::post("/fs/x?mkdir=1&append=1")
                .body(Body::from("y"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_fs_append_accumulates() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        send(
            &router,
            HttpRequest::post("/fs/log.txt?append=1")
                .body(Body::from("one"))
                .unwrap(),
        )
        .await;
        let (status, body) = send(
            &router,
            HttpRequest::post("/fs/log.txt?append=1")
                .body(Body::from("two"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["size"], 6);
    }

    #[tokio::test]
    async fn test_fs_delete_lifecycle() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        send(
            &router,
            HttpRequest::post("/fs/d?mkdir=1").body(Body::empty()).unwrap(),
        )
        .await;

        let (status, body) = send(
            &router,
            HttpRequest::delete("/fs/d").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["deleted"], true);

        // Deleting again is an internal-class failure, not a 404.
        let (status, _) = send(
            &router,
            HttpRequest::delete("/fs/d").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_fs_delete_non_empty_needs_recursive() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        send(
            &router,
            HttpRequest::put("/fs/proj/a.txt").body(Body::from("a")).unwrap(),
        )
        .await;
        send(
            &router,
            HttpRequest::put("/fs/proj/b.txt").body(Body::from("b")).unwrap(),
        )
        .await;

        let (status, body) = send(
            &router,
            HttpRequest::delete("/fs/proj").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json_of(&body)["code"], "DIRECTORY_NOT_EMPTY");

        let (status, _) = send(
            &router,
            HttpRequest::delete("/fs/proj?recursive=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fs_root_listing_sorted() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        std::fs::write(root.path().join("b.txt"), b"b").unwrap();
        std::fs::write(root.path().join("A.txt"), b"a").unwrap();
        let router = build_router(state);

        let (status, body) = send(
            &router,
            HttpRequest::get("/fs").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert_eq!(json["type"], "directory");
        assert_eq!(json["entries"][0]["name"], "A.txt");
        assert_eq!(json["entries"][1]["name"], "b.txt");
    }

    #[tokio::test]
    async fn test_fs_directory_download_is_zip() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        std::fs::create_dir_all(root.path().join("proj")).unwrap();
        std::fs::write(root.path().join("proj/f.txt"), b"zipped").unwrap();
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/fs/proj?download=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"proj.zip\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body.to_vec())).unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("f.txt").unwrap(), &mut content)
            .unwrap();
        assert_eq!(content, "zipped");
    }

    #[tokio::test]
    async fn test_fs_file_download_disposition() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        std::fs::write(root.path().join("r.csv"), b"1,2").unwrap();
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/fs/r.csv?download=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"r.csv\""
        );
    }

    #[tokio::test]
    async fn test_fs_head_headers() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        std::fs::write(root.path().join("h.json"), b"{}").unwrap();
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::head("/fs/h.json").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["X-File-Type"], "file");
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers[header::CONTENT_LENGTH], "2");
        assert!(headers.contains_key(header::LAST_MODIFIED));
        assert!(
            headers
                .get("x-path")
                .unwrap()
                .to_str()
                .unwrap()
                .ends_with("h.json")
        );
    }

    #[tokio::test]
    async fn test_fs_head_on_root_is_directory() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let response = router
            .clone()
            .oneshot(HttpRequest::head("/fs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-File-Type"], "directory");
    }

    // -------------------------------------------------------------------------
    // /mcp transport
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_mcp_get_and_delete_are_405() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        for method in ["GET", "DELETE"] {
            let (status, body) = send(
                &router,
                HttpRequest::builder()
                    .method(method)
                    .uri("/mcp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(json_of(&body)["error"]["code"], -32000);
        }
    }

    #[tokio::test]
    async fn test_mcp_post_tool_roundtrip() {
        let root = TempDir::new().unwrap();
        let router = build_router(test_state(&root));
        let (status, body) = send(
            &router,
            HttpRequest::post("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(&body);
        assert!(json["result"]["tools"].as_array().unwrap().len() >= 4);
    }
}
