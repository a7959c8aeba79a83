//! Layer codec.
//!
//! A layer is a gzip-compressed tar archive of a directory tree. Symlinks
//! are stored as links, modes are preserved, and whiteout markers are
//! ordinary empty files.

use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

use fim_common::error::{FimError, Result};

/// Leading bytes of every layer.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Returns `true` when `path` is a regular file starting with [`GZIP_MAGIC`].
#[must_use]
pub fn is_layer_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    if !file.metadata().is_ok_and(|m| m.is_file()) {
        return false;
    }
    let mut magic = [0_u8; 2];
    file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC
}

/// Packs `src_dir` into a new layer at `dst`.
///
/// The archive is written to `<dst>.tmp` and renamed into place. Returns the
/// packed paths relative to `src_dir`, parents before children.
///
/// # Errors
///
/// Fails before writing anything if `src_dir` is missing or not a
/// directory. Returns an I/O error if the tree cannot be read or the archive
/// cannot be written.
pub fn create_layer(src_dir: &Path, dst: &Path, level: u32) -> Result<Vec<PathBuf>> {
    if !src_dir.exists() {
        return Err(FimError::usage(format!(
            "Source directory '{}' does not exist",
            src_dir.display()
        )));
    }
    if !src_dir.is_dir() {
        return Err(FimError::usage(format!(
            "Source '{}' is not a directory",
            src_dir.display()
        )));
    }
    tracing::info!(src = %src_dir.display(), dst = %dst.display(), level, "creating layer");

    let tmp = tmp_path(dst);
    let packed = match write_archive(src_dir, &tmp, level) {
        Ok(packed) => packed,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    };
    std::fs::rename(&tmp, dst).map_err(|e| FimError::io(dst, e))?;
    tracing::debug!(entries = packed.len(), "layer written");
    Ok(packed)
}

fn write_archive(src_dir: &Path, tmp: &Path, level: u32) -> Result<Vec<PathBuf>> {
    if let Some(parent) = tmp.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FimError::io(parent, e))?;
    }
    let file = File::create(tmp).map_err(|e| FimError::io(tmp, e))?;
    let encoder = flate2::write::GzEncoder::new(
        BufWriter::new(file),
        flate2::Compression::new(level),
    );
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut packed = Vec::new();
    let walker = walkdir::WalkDir::new(src_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| walk_error(src_dir, e))?;
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|_| FimError::Config {
                message: format!("{} escapes {}", entry.path().display(), src_dir.display()),
            })?
            .to_path_buf();
        builder
            .append_path_with_name(entry.path(), &relative)
            .map_err(|e| FimError::io(entry.path(), e))?;
        packed.push(relative);
    }

    let encoder = builder.into_inner().map_err(|e| FimError::io(tmp, e))?;
    let writer = encoder.finish().map_err(|e| FimError::io(tmp, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| FimError::io(tmp, e.into_error()))?;
    file.sync_all().map_err(|e| FimError::io(tmp, e))?;
    Ok(packed)
}

/// Unpacks a layer read from `reader` into `target`.
///
/// # Errors
///
/// Returns an error if the stream is not a valid layer or `target` cannot
/// be written.
pub fn extract_layer(reader: impl Read, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target).map_err(|e| FimError::io(target, e))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(target).map_err(|e| FimError::io(target, e))?;
    Ok(())
}

/// `<path>.tmp`.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn walk_error(root: &Path, err: walkdir::Error) -> FimError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
    FimError::io(path, source)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn sample_tree(root: &Path) {
        std::fs::create_dir_all(root.join("usr/bin")).expect("mkdir");
        std::fs::write(root.join("usr/bin/tool"), "#!/bin/sh\necho hi\n").expect("write");
        std::fs::set_permissions(
            root.join("usr/bin/tool"),
            std::fs::Permissions::from_mode(0o755),
        )
        .expect("chmod");
        std::os::unix::fs::symlink("usr/bin", root.join("bin")).expect("symlink");
    }

    #[test]
    fn missing_source_fails_before_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dst = dir.path().join("out.layer");
        let err = create_layer(&dir.path().join("nope"), &dst, 6).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(err.to_string().contains("nope"));
        assert!(!dst.exists());
        assert!(!tmp_path(&dst).exists());
    }

    #[test]
    fn file_source_is_not_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("plain");
        std::fs::write(&file, "x").expect("write");
        let err = create_layer(&file, &dir.path().join("out.layer"), 6).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Source '{}' is not a directory", file.display())
        );
    }

    #[test]
    fn packed_tree_extracts_with_links_and_modes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src");
        sample_tree(&src);
        let layer = dir.path().join("app.layer");

        let packed = create_layer(&src, &layer, 6).expect("create");
        assert!(packed.contains(&PathBuf::from("usr/bin/tool")));
        assert!(packed.contains(&PathBuf::from("bin")));
        assert!(is_layer_file(&layer));

        let out = dir.path().join("out");
        extract_layer(File::open(&layer).expect("open"), &out).expect("extract");
        let mode = std::fs::metadata(out.join("usr/bin/tool"))
            .expect("stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            std::fs::read_link(out.join("bin")).expect("readlink"),
            PathBuf::from("usr/bin")
        );
    }

    #[test]
    fn parents_are_listed_before_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src");
        sample_tree(&src);
        let packed = create_layer(&src, &dir.path().join("l"), 1).expect("create");
        let usr = packed.iter().position(|p| p == Path::new("usr")).expect("usr");
        let tool = packed
            .iter()
            .position(|p| p == Path::new("usr/bin/tool"))
            .expect("tool");
        assert!(usr < tool);
    }

    #[test]
    fn non_gzip_file_is_not_a_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "plain text").expect("write");
        assert!(!is_layer_file(&file));
        assert!(!is_layer_file(dir.path()));
    }
}
