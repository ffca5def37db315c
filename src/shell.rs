//! Terminal proxy: supervises a loopback ttyd child and reverse-proxies
//! `/shell*` to it, HTTP and WebSocket alike. Forwarded terminal bytes
//! count as user activity.

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::constants::*;
use crate::error::graceful_terminate_process_group;
use crate::runner;
use crate::state::SharedState;

// ============================================================================
// Supervisor
// ============================================================================

/// Keep a ttyd child alive on the loopback port. Respawns a fixed 5 s after
/// any exit; the cadence is deliberately flat to avoid backoff explosions.
pub(crate) async fn run_terminal_supervisor(state: SharedState) {
    if let Err(e) = write_shell_rc(&state).await {
        tracing::warn!(error = %e, "could not write shell rc file");
    }
    let rc_path = state.config.sandbox_root.join(SHELL_RC_FILE);

    loop {
        let mut cmd = tokio::process::Command::new("ttyd");
        cmd.arg("--port")
            .arg(TTYD_PORT.to_string())
            .arg("--interface")
            .arg("127.0.0.1")
            .arg("--writable")
            .arg("bash")
            .arg("--rcfile")
            .arg(&rc_path)
            .current_dir(&state.config.sandbox_root)
            .process_group(0)
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                tracing::info!(port = TTYD_PORT, "terminal server started");
                match child.wait().await {
                    Ok(status) => {
                        tracing::warn!(?status, "terminal server exited, respawning")
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "terminal server wait failed");
                        graceful_terminate_process_group(&mut child, TERM_GRACE_PERIOD_SECONDS)
                            .await;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "terminal server spawn failed"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(TTYD_RESPAWN_DELAY_SECONDS)).await;
    }
}

/// Interactive shells get the same PATH and language environment as the
/// execution endpoints.
async fn write_shell_rc(state: &SharedState) -> std::io::Result<()> {
    let mut rc = String::from("[ -f /etc/bashrc ] && . /etc/bashrc\n");
    for (key, value) in runner::executor_env(&state.config) {
        rc.push_str(&format!("export {key}='{value}'\n"));
    }
    rc.push_str(&format!("cd '{}'\n", state.config.sandbox_root.display()));
    tokio::fs::create_dir_all(&state.config.sandbox_root).await?;
    tokio::fs::write(state.config.sandbox_root.join(SHELL_RC_FILE), rc).await
}

// ============================================================================
// Reverse proxy
// ============================================================================

/// Strip the `/shell` prefix so the upstream sees its own root.
fn upstream_path_query(uri: &Uri) -> String {
    let path = uri.path().strip_prefix("/shell").unwrap_or("");
    let path = if path.is_empty() { "/" } else { path };
    match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    }
}

pub(crate) async fn proxy_entry(
    State(state): State<SharedState>,
    request: Request,
) -> Response {
    if state.config.local_mode {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": "terminal is disabled in local mode" })),
        )
            .into_response();
    }

    let target = upstream_path_query(request.uri());
    let (mut parts, body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => {
            let url = format!("ws://127.0.0.1:{TTYD_PORT}{target}");
            // ttyd speaks its own subprotocol; echo it back on the upgrade.
            upgrade
                .protocols(["tty"])
                .on_upgrade(move |socket| bridge_websocket(state, socket, url))
                .into_response()
        }
        Err(_) => {
            let request = Request::from_parts(parts, body);
            proxy_http(state, target, request).await
        }
    }
}

async fn proxy_http(state: SharedState, target: String, request: Request) -> Response {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), MAX_JSON_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    let url = format!("http://127.0.0.1:{TTYD_PORT}{target}");
    let client = reqwest::Client::new();
    let method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let mut upstream = client.request(method, &url);
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            upstream = upstream.header(name.as_str(), value.as_bytes());
        }
    }
    let response = match upstream.body(body.to_vec()).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, url, "terminal upstream unreachable");
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": "terminal is not available" })),
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    let bytes = response.bytes().await.unwrap_or_default();
    builder
        .body(axum::body::Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "sec-websocket-key"
            | "sec-websocket-version"
            | "sec-websocket-extensions"
            | "sec-websocket-protocol"
    )
}

/// Pump frames both ways between the browser socket and the ttyd socket.
/// Every forwarded frame bumps the activity timestamp.
async fn bridge_websocket(state: SharedState, client: WebSocket, upstream_url: String) {
    let upstream = match tokio_tungstenite::connect_async(upstream_url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(error = %e, url = %upstream_url, "terminal WebSocket connect failed");
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let to_upstream = {
        let state = state.clone();
        async move {
            while let Some(Ok(message)) = client_rx.next().await {
                state.touch_activity();
                let forwarded = match message {
                    AxumMessage::Text(text) => WsMessage::text(text.as_str()),
                    AxumMessage::Binary(bytes) => WsMessage::binary(bytes),
                    AxumMessage::Ping(bytes) => WsMessage::Ping(bytes),
                    AxumMessage::Pong(bytes) => WsMessage::Pong(bytes),
                    AxumMessage::Close(_) => break,
                };
                if upstream_tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            let _ = upstream_tx.send(WsMessage::Close(None)).await;
        }
    };

    let to_client = async move {
        while let Some(Ok(message)) = upstream_rx.next().await {
            state.touch_activity();
            let forwarded = match message {
                WsMessage::Text(text) => AxumMessage::Text(text.as_str().into()),
                WsMessage::Binary(bytes) => AxumMessage::Binary(bytes),
                WsMessage::Ping(bytes) => AxumMessage::Ping(bytes),
                WsMessage::Pong(bytes) => AxumMessage::Pong(bytes),
                WsMessage::Close(_) => break,
                WsMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(AxumMessage::Close(None)).await;
    };

    // Either side closing tears the bridge down.
    tokio::select! {
        _ = to_upstream => {}
        _ = to_client => {}
    }
}

// ============================================================================
// Tests
// ============================================================================
