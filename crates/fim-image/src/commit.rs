//! Layer Committer: snapshots the upper directory into a new layer.

use std::path::{Path, PathBuf};

use fim_common::config::FimConfig;
use fim_common::error::{FimError, Result};

use crate::layer::create_layer;
use crate::lock::DataLock;
use crate::store::{LayerStore, LayerTarget};
use crate::whiteout;

/// Commits the upper directory of `config` to `target`.
///
/// The destination is validated before anything is touched: the binary must
/// be an ELF64 image, a managed slot must be free, a file must not exist. On
/// success the committed entries are erased from the upper directory; entries
/// that cannot be removed are logged and left behind.
///
/// Returns the path now holding the new layer.
///
/// # Errors
///
/// Returns [`FimError::LayerSlotsExhausted`] when no managed slot is left,
/// a usage error when a file target already exists, a config error when the
/// binary is not ELF64, or an I/O error if the snapshot cannot be written or
/// routed.
pub fn commit(config: &FimConfig, target: &LayerTarget) -> Result<PathBuf> {
    let _lock = DataLock::acquire(&config.lock_file())?;
    let store = LayerStore::new(config);
    store.check_target(target)?;

    let upper = config.upper_dir();
    std::fs::create_dir_all(&upper).map_err(|e| FimError::io(&upper, e))?;
    let _ = whiteout::normalize(&upper)?;

    let snapshot = config
        .tmp_dir()
        .join(format!("commit-{}.layer", std::process::id()));
    let packed = create_layer(&upper, &snapshot, config.compression_level)?;
    let routed = store.add_locked(&snapshot, target);
    if let Err(e) = std::fs::remove_file(&snapshot) {
        tracing::warn!(path = %snapshot.display(), error = %e, "cannot remove commit snapshot");
    }
    let destination = routed?;

    erase(&upper, &packed);
    tracing::info!(entries = packed.len(), destination = %destination.display(), "upper layer committed");
    Ok(destination)
}

/// Removes `packed` paths from `root`, children before parents.
///
/// Directories are only removed once empty.
fn erase(root: &Path, packed: &[PathBuf]) {
    for relative in packed.iter().rev() {
        let path = root.join(relative);
        let Ok(meta) = path.symlink_metadata() else {
            continue;
        };
        if meta.is_dir() {
            if let Err(e) = std::fs::remove_dir(&path) {
                tracing::warn!(error = %e, "Could not remove directory {}", path.display());
            }
        } else if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(error = %e, "Could not remove file {}", path.display());
        }
    }
}
