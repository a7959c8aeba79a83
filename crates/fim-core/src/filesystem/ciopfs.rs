//! Case-insensitive view over a mounted root, via `ciopfs`.

use std::path::Path;

use fim_common::error::Result;

use super::daemon_log;
use super::fuse::FuseMount;

/// Mounts `source` case-insensitively at `mountpoint`.
///
/// # Errors
///
/// Returns an error if `ciopfs` is missing or fails to mount.
pub fn mount(source: &Path, mountpoint: &Path, log_dir: &Path) -> Result<FuseMount> {
    tracing::debug!(source = %source.display(), mountpoint = %mountpoint.display(), "mounting ciopfs");
    FuseMount::spawn(
        &["ciopfs"],
        vec![
            "-f".into(),
            source.as_os_str().to_owned(),
            mountpoint.as_os_str().to_owned(),
        ],
        mountpoint,
        &daemon_log(log_dir, "ciopfs"),
    )
}
