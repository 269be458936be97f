//! Oversized payloads written to private JSON files.

use crate::error::{DbError, DbResult};
use crate::models::OutputFile;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Format a byte count for display.
///
/// Powered by the `humansize` crate with WINDOWS preset (1024-based, kB/MB/GB units).
///
/// ```
/// use pg_mcp_server::db::spill::format_size;
///
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1024), "1 kB");
/// assert_eq!(format_size(1048576), "1 MB");
/// ```
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::WINDOWS)
}

/// Serialize `payload` into a new `pg-mcp-*.json` file under `dir`.
///
/// The file is readable by the owner only and outlives the process; the
/// caller is told its path and is responsible for deleting it.
pub async fn write_json<T: Serialize>(
    dir: &Path,
    payload: &T,
    row_count: Option<usize>,
) -> DbResult<OutputFile> {
    let bytes = serde_json::to_vec_pretty(payload)
        .map_err(|e| DbError::internal(format!("Failed to serialize result: {e}")))?;
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || persist(&dir, &bytes, row_count))
        .await
        .map_err(|e| DbError::internal(format!("Output file task failed: {e}")))?
}

fn persist(dir: &Path, bytes: &[u8], row_count: Option<usize>) -> DbResult<OutputFile> {
    let io_error = |e: std::io::Error| {
        DbError::internal(format!("Failed to write output file in {}: {}", dir.display(), e))
    };

    std::fs::create_dir_all(dir).map_err(io_error)?;
    let mut file = tempfile::Builder::new()
        .prefix("pg-mcp-")
        .suffix(".json")
        .tempfile_in(dir)
        .map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(io_error)?;
    }

    file.write_all(bytes).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    let (_, path): (_, PathBuf) = file.keep().map_err(|e| io_error(e.error))?;

    let size_bytes = bytes.len() as u64;
    info!(path = %path.display(), size_bytes, "Result written to output file");
    Ok(OutputFile {
        path: path.display().to_string(),
        size_bytes,
        size_human: format_size(size_bytes),
        row_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_json_creates_private_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("results");
        let payload = serde_json::json!({"rows": [{"id": 1}, {"id": 2}]});

        let file = write_json(&nested, &payload, Some(2)).await.unwrap();
        let path = Path::new(&file.path);
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("pg-mcp-"));
        assert!(name.ends_with(".json"));
        assert_eq!(file.row_count, Some(2));

        let content = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(file.size_bytes, content.len() as u64);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(2048), "2 kB");
    }
}
