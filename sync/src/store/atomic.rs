//! Crash-safe file replacement.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Sibling temp path for `path`, unique per call.
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    path.with_file_name(format!("{file_name}.tmp-{}", uuid::Uuid::new_v4().simple()))
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// contents, never a partial file.
///
/// The temp file is removed if any step fails.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    let result = write_then_rename(&tmp, path, bytes).await;
    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(tmp = %tmp.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
    result
}

async fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    {
        let mut file = fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
    }
    fs::rename(tmp, path).await?;
    sync_parent_dir(path).await
}

async fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::File::open(parent).await?.sync_all().await?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
