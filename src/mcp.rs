//! MCP facade: the execution and filesystem operations exposed as JSON-RPC
//! tools over streaming HTTP. A fresh server value is built per request and
//! dropped when the connection closes.

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::constants::{MAX_JSON_BODY_BYTES, VERSION};
use crate::executor;
use crate::fsops;
use crate::paths;
use crate::state::SharedState;
use crate::types::Language;

const PROTOCOL_VERSION: &str = "2024-11-05";

pub(crate) async fn mcp_entry(State(state): State<SharedState>, request: Request) -> Response {
    // The transport only accepts POST; GET (SSE) and DELETE (session
    // teardown) are not offered.
    if request.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            axum::Json(json!({
                "jsonrpc": "2.0",
                "error": { "code": -32000, "message": "Method not allowed" },
                "id": null
            })),
        )
            .into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_JSON_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return rpc_error_response(Value::Null, -32700, &format!("unreadable body: {e}")),
    };
    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return rpc_error_response(Value::Null, -32700, &format!("parse error: {e}")),
    };

    let server = McpServer { state: &state };
    match server.handle(message).await {
        Some(response) => (
            [(header::CONTENT_TYPE, "application/json")],
            response.to_string(),
        )
            .into_response(),
        // Notifications produce no response body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn rpc_error_response(id: Value, code: i64, message: &str) -> Response {
    axum::Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    }))
    .into_response()
}

/// One request's server instance. Owns nothing beyond a state borrow; torn
/// down with the connection.
struct McpServer<'a> {
    state: &'a SharedState,
}

impl McpServer<'_> {
    async fn handle(&self, request: Value) -> Option<Value> {
        let method = request.get("method")?.as_str()?.to_string();
        let id = request.get("id").cloned();
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        if method.starts_with("notifications/") {
            return None;
        }

        let result = match method.as_str() {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list()),
            "tools/call" => self.tools_call(params).await,
            _ => Err((-32601, format!("Method not found: {method}"))),
        };

        let response = match result {
            Ok(result) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result
            }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            }),
        };
        Some(response)
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "sandboxd", "version": VERSION }
        })
    }

    fn tools_list(&self) -> Value {
        json!({ "tools": [
            {
                "name": "execute",
                "description": "Run a shell command or a js/ts/py snippet inside the sandbox",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "Command or source code to run" },
                        "language": { "type": "string", "description": "shell (default), js, ts or py" },
                        "cwd": { "type": "string", "description": "Working directory inside the sandbox" },
                        "timeoutSecs": { "type": "integer", "minimum": 1 }
                    },
                    "required": ["command"]
                }
            },
            {
                "name": "write-file",
                "description": "Write a text file under the sandbox root, creating parent directories",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" },
                        "mode": { "type": "string", "description": "Octal permissions, e.g. 755" }
                    },
                    "required": ["path", "content"]
                }
            },
            {
                "name": "read-file",
                "description": "Read a file under the sandbox root",
                "inputSchema": {
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }
            },
            {
                "name": "list-files",
                "description": "List a directory under the sandbox root",
                "inputSchema": {
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }
            }
        ] })
    }

    async fn tools_call(&self, params: Value) -> Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or((-32602, "missing tool name".to_string()))?;
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let outcome = match name {
            "execute" => self.tool_execute(args).await,
            "write-file" => self.tool_write_file(args).await,
            "read-file" => self.tool_read_file(args).await,
            "list-files" => self.tool_list_files(args).await,
            other => return Err((-32602, format!("unknown tool: {other}"))),
        };

        // Tool failures are results with isError, not protocol errors.
        let (payload, is_error) = match outcome {
            Ok((payload, is_error)) => (payload, is_error),
            Err(message) => (json!({ "error": message }), true),
        };
        Ok(json!({
            "content": [{ "type": "text", "text": payload.to_string() }],
            "isError": is_error
        }))
    }

    async fn tool_execute(&self, args: Value) -> Result<(Value, bool), String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or("missing required argument: command")?;
        if command.trim().is_empty() {
            return Err("command must not be empty".into());
        }
        let language = args.get("language").and_then(|v| v.as_str());
        let lang = Language::parse(language)
            .ok_or_else(|| format!("invalid language '{}'", language.unwrap_or_default()))?;
        let cwd = args.get("cwd").and_then(|v| v.as_str());
        let timeout_secs = args.get("timeoutSecs").and_then(|v| v.as_u64());

        let result =
            executor::execute_request(&self.state.config, command, lang, cwd, timeout_secs)
                .await
                .map_err(|e| e.to_string())?;
        let failed = result.exit_code != 0;
        Ok((serde_json::to_value(&result).unwrap_or_default(), failed))
    }

    async fn tool_write_file(&self, args: Value) -> Result<(Value, bool), String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or("missing required argument: path")?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or("missing required argument: content")?;
        let mode = args
            .get("mode")
            .and_then(|v| v.as_str())
            .and_then(|m| u32::from_str_radix(m, 8).ok());

        let resolved = paths::resolve(&self.state.config.sandbox_root, path)
            .map_err(|e| e.to_string())?;
        let size = fsops::write_bytes(&resolved, content.as_bytes(), mode)
            .await
            .map_err(|e| e.to_string())?;
        Ok((
            json!({ "success": true, "path": resolved.display().to_string(), "size": size }),
            false,
        ))
    }

    async fn tool_read_file(&self, args: Value) -> Result<(Value, bool), String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or("missing required argument: path")?;
        let resolved = paths::resolve_existing(&self.state.config.sandbox_root, path)
            .map_err(|e| e.for_read().to_string())?;
        let bytes = fsops::read_bytes(&resolved).await.map_err(|e| e.to_string())?;
        Ok((
            json!({
                "path": resolved.display().to_string(),
                "content": String::from_utf8_lossy(&bytes),
                "size": bytes.len(),
                "mimeType": fsops::mime_for_path(&resolved)
            }),
            false,
        ))
    }

    async fn tool_list_files(&self, args: Value) -> Result<(Value, bool), String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let resolved = paths::resolve_existing(&self.state.config.sandbox_root, path)
            .map_err(|e| e.for_read().to_string())?;
        let entries = fsops::list_detailed(&resolved)
            .await
            .map_err(|e| e.to_string())?;
        Ok((
            json!({
                "path": resolved.display().to_string(),
                "type": "directory",
                "entries": entries
            }),
            false,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================
