use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// Sibling temp path for `target`: `.<name>.<uuid>.tmp` in the same directory.
pub(crate) fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let temp_name = format!(".{name}.{}.tmp", Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Write `bytes` to `target` through a temp file + rename.
///
/// The target is either the previous content or the new content, never a partial write.
pub(crate) async fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_sibling(target);
    let written = write_synced(&temp_path, bytes).await;
    let result = match written {
        Ok(()) => fs::rename(&temp_path, target).await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(
                    temp = %temp_path.display(),
                    error = %cleanup,
                    "failed to remove temp file after aborted write"
                );
            }
        }
        return Err(err);
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
