//! Sandboxed file operations. Callers resolve paths through `paths` first;
//! everything here works on absolute paths already confined to the root.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::OpError;
use crate::types::FsEntry;

// ============================================================================
// Stat
// ============================================================================

/// Metadata sentinel: a missing path is a value, not an error.
#[derive(Debug)]
pub(crate) struct StatInfo {
    pub(crate) exists: bool,
    pub(crate) is_dir: bool,
    pub(crate) size: u64,
    pub(crate) mtime: Option<std::time::SystemTime>,
}

pub(crate) async fn stat(path: &Path) -> StatInfo {
    match tokio::fs::metadata(path).await {
        Ok(meta) => StatInfo {
            exists: true,
            is_dir: meta.is_dir(),
            size: meta.len(),
            mtime: meta.modified().ok(),
        },
        Err(_) => StatInfo {
            exists: false,
            is_dir: false,
            size: 0,
            mtime: None,
        },
    }
}

// ============================================================================
// Read / write / append
// ============================================================================

pub(crate) async fn read_bytes(path: &Path) -> Result<Vec<u8>, OpError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| OpError::not_found(format!("no such file: {}", path.display())))?;
    if meta.is_dir() {
        return Err(OpError::validation(format!(
            "{} is a directory, not a file",
            path.display()
        )));
    }
    tokio::fs::read(path).await.map_err(OpError::from)
}

/// Truncate-replace write. Parent directories are created recursively; the
/// optional `mode` is applied after the write. Returns the byte length.
pub(crate) async fn write_bytes(
    path: &Path,
    bytes: &[u8],
    mode: Option<u32>,
) -> Result<u64, OpError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(bytes.len() as u64)
}

/// Append, creating the file (and parents) if missing. Returns the new
/// total file length.
pub(crate) async fn append_bytes(path: &Path, bytes: &[u8]) -> Result<u64, OpError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
    let len = file.metadata().await?.len();
    Ok(len)
}

// ============================================================================
// Mkdir / delete
// ============================================================================

/// Recursive and idempotent: an already-existing directory is success.
pub(crate) async fn mkdir(path: &Path) -> Result<(), OpError> {
    let meta = tokio::fs::metadata(path).await;
    if let Ok(meta) = meta {
        if meta.is_dir() {
            return Ok(());
        }
        return Err(OpError::validation(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    tokio::fs::create_dir_all(path).await.map_err(OpError::from)
}

pub(crate) async fn delete(path: &Path, recursive: bool) -> Result<(), OpError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| OpError::not_found(format!("no such path: {}", path.display())))?;
    if !meta.is_dir() {
        return tokio::fs::remove_file(path).await.map_err(OpError::from);
    }
    if recursive {
        return tokio::fs::remove_dir_all(path).await.map_err(OpError::from);
    }
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Err(OpError::conflict(format!(
            "directory not empty: {}",
            path.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Enumerate a directory. A per-entry stat failure omits the size but never
/// aborts the listing. Entries sort case-insensitively by name.
pub(crate) async fn list_detailed(path: &Path) -> Result<Vec<FsEntry>, OpError> {
    let mut read_dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| OpError::internal(format!("cannot list {}: {e}", path.display())))?;

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        match entry.metadata().await {
            Ok(meta) if meta.is_dir() => entries.push(FsEntry {
                name,
                entry_type: "directory",
                size: None,
            }),
            Ok(meta) => entries.push(FsEntry {
                name,
                entry_type: "file",
                size: Some(meta.len()),
            }),
            Err(_) => entries.push(FsEntry {
                name,
                entry_type: "file",
                size: None,
            }),
        }
    }

    entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(entries)
}

// ============================================================================
// Directory archival
// ============================================================================

/// Build a ZIP of the directory's contents, entry names relative to it,
/// deflate level 6. Runs on the blocking pool.
pub(crate) async fn zip_dir(path: &Path) -> Result<Vec<u8>, OpError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || zip_dir_blocking(&path))
        .await
        .map_err(|e| OpError::internal(format!("zip task failed: {e}")))?
}

fn zip_dir_blocking(dir: &Path) -> Result<Vec<u8>, OpError> {
    use zip::write::SimpleFileOptions;

    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);

    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|e| OpError::internal(format!("cannot read {}: {e}", current.display())))?;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            let rel = entry_path
                .strip_prefix(dir)
                .map_err(|e| OpError::internal(e.to_string()))?
                .to_string_lossy()
                .to_string();
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                writer
                    .add_directory(format!("{rel}/"), options)
                    .map_err(|e| OpError::internal(format!("zip: {e}")))?;
                stack.push(entry_path);
            } else if meta.is_file() {
                let bytes = match std::fs::read(&entry_path) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                writer
                    .start_file(rel.as_str(), options)
                    .map_err(|e| OpError::internal(format!("zip: {e}")))?;
                writer
                    .write_all(&bytes)
                    .map_err(|e| OpError::internal(format!("zip: {e}")))?;
            }
        }
    }

    let cursor = writer
        .finish()
        .map_err(|e| OpError::internal(format!("zip finalize: {e}")))?;
    Ok(cursor.into_inner())
}

// ============================================================================
// MIME inference
// ============================================================================

/// MIME type from the path extension. Unknown extensions fall back to
/// `application/octet-stream`.
pub(crate) fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("js") | Some("mjs") => "text/javascript",
        Some("ts") => "video/mp2t",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("py") => "text/x-python",
        Some("sh") => "application/x-sh",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// Tests
// ============================================================================
