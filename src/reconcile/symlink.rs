//! Symlink reconciliation

use crate::SetupError;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Point `link` at `target`.
///
/// An existing symlink at `link` is always removed first, whatever it points
/// to (dangling included). Anything else occupying `link` is an error.
pub async fn ensure_symlink(link: &Path, target: &Path) -> Result<(), SetupError> {
    if let Ok(meta) = fs::symlink_metadata(link).await {
        if meta.file_type().is_symlink() {
            debug!("Replacing existing symlink {}", link.display());
            fs::remove_file(link).await?;
        }
    }

    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await?;
    }

    fs::symlink(target, link)
        .await
        .map_err(|e| SetupError::resource(link, format!("cannot create symlink: {}", e)))?;
    debug!("Linked {} -> {}", link.display(), target.display());
    Ok(())
}
