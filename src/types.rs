//! Wire types for the HTTP and MCP surfaces, plus the migration manifest.

use serde::{Deserialize, Serialize};

// ============================================================================
// Language dispatch
// ============================================================================

/// Canonical execution languages after alias normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Language {
    Shell,
    Js,
    Ts,
    Py,
}

impl Language {
    /// Parse a user-supplied language string. `None` (absent) means shell.
    pub(crate) fn parse(s: Option<&str>) -> Option<Self> {
        let s = match s {
            None => return Some(Self::Shell),
            Some(s) => s.trim().to_ascii_lowercase(),
        };
        match s.as_str() {
            "" | "shell" | "bash" | "sh" => Some(Self::Shell),
            "js" | "javascript" => Some(Self::Js),
            "ts" | "typescript" => Some(Self::Ts),
            "py" | "python" => Some(Self::Py),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Js => "js",
            Self::Ts => "ts",
            Self::Py => "py",
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecRequest {
    #[serde(default)]
    pub(crate) command: String,
    pub(crate) language: Option<String>,
    pub(crate) cwd: Option<String>,
    pub(crate) timeout_secs: Option<u64>,
}

/// Uniform result of shell and code execution. `exit_code` is zero only
/// when the child terminated normally with status 0 and did not time out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecutionResult {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: i32,
    pub(crate) language: &'static str,
}

// ============================================================================
// Filesystem
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FsEntry {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) entry_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DirListing {
    pub(crate) path: String,
    #[serde(rename = "type")]
    pub(crate) entry_type: &'static str,
    pub(crate) entries: Vec<FsEntry>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WriteResponse {
    pub(crate) success: bool,
    pub(crate) path: String,
    pub(crate) size: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MkdirResponse {
    pub(crate) success: bool,
    pub(crate) path: String,
    #[serde(rename = "type")]
    pub(crate) entry_type: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteResponse {
    pub(crate) success: bool,
    pub(crate) path: String,
    pub(crate) deleted: bool,
}

// ============================================================================
// Migration manifest (v1)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MigrationManifest {
    pub(crate) version: u32,
    pub(crate) created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) run_id: Option<String>,
    pub(crate) startup_timestamp: i64,
    pub(crate) packages: PackageSnapshot,
    pub(crate) changed_files: ChangedFiles,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PackageSnapshot {
    pub(crate) apt: Vec<String>,
    pub(crate) pip: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangedFiles {
    pub(crate) count: usize,
    pub(crate) total_size: u64,
    pub(crate) paths: Vec<String>,
}

// ============================================================================
// Platform events
// ============================================================================

/// Lifecycle event delivered on the orchestrator's events WebSocket.
/// Only `migrating` is acted upon; everything else is ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct PlatformEvent {
    pub(crate) name: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub(crate) data: Option<serde_json::Value>,
}

/// Aggregated result of one language's dependency installation.
#[derive(Debug, Default)]
pub(crate) struct InstallReport {
    pub(crate) success: bool,
    pub(crate) installed: Vec<String>,
    pub(crate) failed: Vec<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, Some(Language::Shell))]
    #[case(Some("shell"), Some(Language::Shell))]
    #[case(Some("bash"), Some(Language::Shell))]
    #[case(Some("sh"), Some(Language::Shell))]
    #[case(Some("js"), Some(Language::Js))]
    #[case(Some("javascript"), Some(Language::Js))]
    #[case(Some("ts"), Some(Language::Ts))]
    #[case(Some("typescript"), Some(Language::Ts))]
    #[case(Some("py"), Some(Language::Py))]
    #[case(Some("python"), Some(Language::Py))]
    #[case(Some("PYTHON"), Some(Language::Py))]
    #[case(Some(" js "), Some(Language::Js))]
    #[case(Some(""), Some(Language::Shell))]
    #[case(Some("cobol"), None)]
    #[case(Some("node"), None)]
    fn test_language_parse(#[case] input: Option<&str>, #[case] expected: Option<Language>) {
        assert_eq!(Language::parse(input), expected);
    }

    #[test]
    fn test_language_roundtrip() {
        for lang in [Language::Shell, Language::Js, Language::Ts, Language::Py] {
            assert_eq!(Language::parse(Some(lang.as_str())), Some(lang));
        }
    }

    #[test]
    fn test_exec_request_minimal() {
        let req: ExecRequest = serde_json::from_str(r#"{"command":"echo hi"}"#).unwrap();
        assert_eq!(req.command, "echo hi");
        assert!(req.language.is_none());
        assert!(req.cwd.is_none());
        assert!(req.timeout_secs.is_none());
    }

    #[test]
    fn test_exec_request_full() {
        let req: ExecRequest = serde_json::from_str(
            r#"{"command":"print(1)","language":"python","cwd":"proj","timeoutSecs":5}"#,
        )
        .unwrap();
        assert_eq!(req.language.as_deref(), Some("python"));
        assert_eq!(req.cwd.as_deref(), Some("proj"));
        assert_eq!(req.timeout_secs, Some(5));
    }

    #[test]
    fn test_execution_result_serializes_camel_case() {
        let result = ExecutionResult {
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
            language: "py",
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"exitCode\":0"));
        assert!(json.contains("\"language\":\"py\""));
    }

    #[test]
    fn test_fs_entry_omits_missing_size() {
        let entry = FsEntry {
            name: "d".into(),
            entry_type: "directory",
            size: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("size"));
        assert!(json.contains("\"type\":\"directory\""));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = MigrationManifest {
            version: 1,
            created_at: "2026-01-01T00:00:00Z".into(),
            run_id: Some("run-1".into()),
            startup_timestamp: 1_700_000_000,
            packages: PackageSnapshot {
                apt: vec!["jq".into()],
                pip: vec!["requests==2.31.0".into()],
            },
            changed_files: ChangedFiles {
                count: 2,
                total_size: 99,
                paths: vec!["/sandbox/a".into(), "/sandbox/b".into()],
            },
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"changedFiles\""));
        let back: MigrationManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 1);
        assert_eq!(back.changed_files.count, 2);
        assert_eq!(back.packages.apt, vec!["jq".to_string()]);
    }

    #[test]
    fn test_manifest_run_id_omitted_when_none() {
        let manifest = MigrationManifest {
            version: 1,
            created_at: "x".into(),
            run_id: None,
            startup_timestamp: 0,
            packages: PackageSnapshot::default(),
            changed_files: ChangedFiles::default(),
        };
        assert!(!serde_json::to_string(&manifest).unwrap().contains("runId"));
    }

    #[test]
    fn test_platform_event_parse() {
        let ev: PlatformEvent = serde_json::from_str(r#"{"name":"migrating"}"#).unwrap();
        assert_eq!(ev.name, "migrating");
    }
}
