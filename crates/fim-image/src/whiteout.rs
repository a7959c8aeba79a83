//! Whiteout normalization of the upper directory.
//!
//! Each overlay backend records deletions its own way. Before the upper
//! directory is snapshotted, every form is rewritten into the portable
//! markers understood by layer composition:
//!
//! | backend | deletion record | marker |
//! |---|---|---|
//! | overlayfs | character device 0/0 | `.wh.<name>` |
//! | overlayfs | `*.overlay.opaque = y` xattr | `.wh..wh..opq` |
//! | unionfs | `.unionfs-fuse/<path>_HIDDEN~` | `.wh.<name>` |
//!
//! Failures are logged and skipped: a partially normalized upper directory
//! still commits.

use std::fs::File;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use fim_common::error::Result;

/// File-name prefix of a deletion marker.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding every lower entry of its directory.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const OPAQUE_XATTRS: &[&str] = &["trusted.overlay.opaque", "user.overlay.opaque"];
const UNIONFS_META_DIRS: &[&str] = &[".unionfs-fuse", ".unionfs"];
const UNIONFS_HIDDEN_SUFFIX: &str = "_HIDDEN~";

/// Rewrites backend-specific deletion records under `upper` into markers.
///
/// Returns the number of markers written.
///
/// # Errors
///
/// Returns an error only if `upper` itself cannot be walked.
pub fn normalize(upper: &Path) -> Result<usize> {
    if !upper.is_dir() {
        return Ok(0);
    }
    let mut written = 0;

    for meta_dir in UNIONFS_META_DIRS.iter().map(|d| upper.join(d)) {
        if meta_dir.is_dir() {
            written += normalize_unionfs(upper, &meta_dir);
        }
    }

    let mut devices = Vec::new();
    let mut opaque_dirs = Vec::new();
    for entry in walkdir::WalkDir::new(upper).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "cannot inspect upper entry");
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_char_device() {
            if entry.metadata().is_ok_and(|m| m.rdev() == 0) {
                devices.push(entry.into_path());
            }
        } else if file_type.is_dir() && is_opaque(entry.path()) {
            opaque_dirs.push(entry.into_path());
        }
    }

    for device in devices {
        let Some(marker) = marker_for(&device) else {
            continue;
        };
        if let Err(e) = std::fs::remove_file(&device) {
            tracing::warn!(path = %device.display(), error = %e, "Could not remove file {}", device.display());
            continue;
        }
        if touch(&marker) {
            written += 1;
        }
    }

    for dir in opaque_dirs {
        if touch(&dir.join(WHITEOUT_OPAQUE)) {
            written += 1;
        }
        for name in OPAQUE_XATTRS {
            let _ = xattr::remove(&dir, name);
        }
    }

    if written > 0 {
        tracing::info!(upper = %upper.display(), markers = written, "whiteouts normalized");
    }
    Ok(written)
}

fn normalize_unionfs(upper: &Path, meta_dir: &Path) -> usize {
    let mut written = 0;
    for entry in walkdir::WalkDir::new(meta_dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        let name = entry.file_name().to_string_lossy();
        let Some(original) = name.strip_suffix(UNIONFS_HIDDEN_SUFFIX) else {
            continue;
        };
        let Ok(relative) = entry.path().strip_prefix(meta_dir) else {
            continue;
        };
        let hidden = upper.join(relative).with_file_name(original);
        if let Some(marker) = marker_for(&hidden) {
            if touch(&marker) {
                written += 1;
            }
        }
    }
    if let Err(e) = std::fs::remove_dir_all(meta_dir) {
        tracing::warn!(path = %meta_dir.display(), error = %e, "Could not remove directory {}", meta_dir.display());
    }
    written
}

fn is_opaque(dir: &Path) -> bool {
    OPAQUE_XATTRS
        .iter()
        .any(|name| matches!(xattr::get(dir, name), Ok(Some(v)) if v == b"y"))
}

fn marker_for(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy();
    Some(path.with_file_name(format!("{WHITEOUT_PREFIX}{name}")))
}

fn touch(path: &Path) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "cannot create whiteout parent");
            return false;
        }
    }
    match File::create(path) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot write whiteout marker");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unionfs_hidden_entries_become_markers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let upper = dir.path();
        let meta = upper.join(".unionfs-fuse/etc");
        std::fs::create_dir_all(&meta).expect("mkdir");
        std::fs::write(meta.join("motd_HIDDEN~"), "").expect("write");

        assert_eq!(normalize(upper).expect("normalize"), 1);
        assert!(upper.join("etc/.wh.motd").is_file());
        assert!(!upper.join(".unionfs-fuse").exists());
    }

    #[test]
    fn plain_upper_is_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("file"), "x").expect("write");
        assert_eq!(normalize(dir.path()).expect("normalize"), 0);
        assert!(dir.path().join("file").exists());
    }

    #[test]
    fn user_opaque_xattr_becomes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opaque = dir.path().join("opt");
        std::fs::create_dir_all(&opaque).expect("mkdir");
        if xattr::set(&opaque, "user.overlay.opaque", b"y").is_err() {
            return;
        }
        assert_eq!(normalize(dir.path()).expect("normalize"), 1);
        assert!(opaque.join(WHITEOUT_OPAQUE).is_file());
        assert!(xattr::get(&opaque, "user.overlay.opaque").expect("get").is_none());
    }

    #[test]
    fn missing_upper_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(normalize(&dir.path().join("none")).expect("normalize"), 0);
    }
}
