//! Extracted layer cache and whiteout-aware composition.
//!
//! Every layer is unpacked once into `<data>/cache/layers/<key>`, keyed by its
//! content (see [`hash::layer_key`]). Unpacking happens in a private sibling
//! directory that is renamed into place, so a concurrent instance either sees
//! a complete tree or none at all. Entries no longer backing the current
//! stack are removed by [`LayerCache::prune`].
//!
//! Overlay backends do not agree on whiteout markers, so when layer `k`
//! carries `.wh.` markers, layers `0..=k` are flattened into one composite
//! directory that already has the deletions applied.

use std::path::{Path, PathBuf};

use fim_common::error::{FimError, Result};

use crate::hash;
use crate::layer::extract_layer;
use crate::store::LayerEntry;
use crate::whiteout::{WHITEOUT_OPAQUE, WHITEOUT_PREFIX};

/// Directory of extracted layers.
#[derive(Debug, Clone)]
pub struct LayerCache {
    dir: PathBuf,
}

impl LayerCache {
    /// Opens the cache rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the extracted tree of `layer`, unpacking it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be read or unpacked.
    pub fn materialize(&self, layer: &LayerEntry) -> Result<PathBuf> {
        let key = hash::layer_key(&layer.path, layer.offset, layer.size)?;
        let target = self.dir.join(&key);
        if target.is_dir() {
            tracing::debug!(layer = %layer.path.display(), offset = layer.offset, "layer cache hit");
            return Ok(target);
        }
        tracing::info!(layer = %layer.path.display(), offset = layer.offset, "extracting layer");
        self.publish(&target, |staging| extract_layer(layer.open()?, staging))?;
        Ok(target)
    }

    /// Materializes `layers` and flattens them up to the highest layer that
    /// carries whiteouts.
    ///
    /// Returns the lower directories to stack, lowest first.
    ///
    /// # Errors
    ///
    /// Returns an error if any layer cannot be extracted or the composite
    /// cannot be built.
    pub fn compose(&self, layers: &[LayerEntry]) -> Result<Vec<PathBuf>> {
        let dirs = layers
            .iter()
            .map(|l| self.materialize(l))
            .collect::<Result<Vec<_>>>()?;
        let Some(last) = dirs.iter().rposition(|d| has_whiteouts(d)) else {
            return Ok(dirs);
        };

        let keys: Vec<String> = dirs[..=last]
            .iter()
            .map(|d| d.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned()))
            .collect();
        let target = self.dir.join(format!("composite-{}", hash::combined_key(&keys)));
        if !target.is_dir() {
            tracing::info!(layers = last + 1, "flattening layers with whiteouts");
            self.publish(&target, |staging| {
                for dir in &dirs[..=last] {
                    merge_tree(dir, staging)?;
                }
                Ok(())
            })?;
        }

        let mut lowers = Vec::with_capacity(dirs.len() - last);
        lowers.push(target);
        lowers.extend_from_slice(&dirs[last + 1..]);
        Ok(lowers)
    }

    /// Cache directories of `layers`, whether or not they are extracted yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be read.
    pub fn entries_for(&self, layers: &[LayerEntry]) -> Result<Vec<PathBuf>> {
        layers
            .iter()
            .map(|l| Ok(self.dir.join(hash::layer_key(&l.path, l.offset, l.size)?)))
            .collect()
    }

    /// Removes every cache entry not listed in `keep` and returns how many
    /// were removed. Staging directories of in-flight extractions are left
    /// alone.
    ///
    /// The caller must ensure no other instance is using the cache.
    pub fn prune(&self, keep: &[PathBuf]) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') || keep.contains(&path) {
                continue;
            }
            match remove_entry(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(error = %e, "cannot prune cache entry"),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "pruned unused layer cache entries");
        }
        removed
    }

    fn publish(&self, target: &Path, fill: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| FimError::io(&self.dir, e))?;
        let name = target
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        let staging = self
            .dir
            .join(format!(".{name}.{}.partial", std::process::id()));
        if staging.exists() {
            remove_tree(&staging);
        }
        std::fs::create_dir_all(&staging).map_err(|e| FimError::io(&staging, e))?;

        if let Err(e) = fill(&staging) {
            remove_tree(&staging);
            return Err(e);
        }
        match std::fs::rename(&staging, target) {
            Ok(()) => Ok(()),
            Err(_) if target.is_dir() => {
                tracing::debug!(path = %target.display(), "cache entry published concurrently");
                remove_tree(&staging);
                Ok(())
            }
            Err(e) => {
                remove_tree(&staging);
                Err(FimError::io(target, e))
            }
        }
    }
}

/// Whether any entry under `dir` is a whiteout marker.
#[must_use]
pub fn has_whiteouts(dir: &Path) -> bool {
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .any(|e| e.file_name().to_string_lossy().starts_with(WHITEOUT_PREFIX))
}

/// Copies `src` over `dst`, applying its whiteout markers to what `dst`
/// already holds.
fn merge_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| FimError::io(src, e))?
        .filter_map(std::result::Result::ok)
        .collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    if entries.iter().any(|e| e.file_name() == WHITEOUT_OPAQUE) {
        clear_dir(dst)?;
    }
    for entry in &entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == WHITEOUT_OPAQUE {
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = dst.join(hidden);
            if victim.symlink_metadata().is_ok() {
                remove_entry(&victim)?;
            }
        }
    }

    for entry in entries {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(WHITEOUT_PREFIX) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let meta = std::fs::symlink_metadata(&from).map_err(|e| FimError::io(&from, e))?;
        let existing = std::fs::symlink_metadata(&to).ok();

        if meta.is_dir() {
            if existing.as_ref().is_some_and(|m| !m.is_dir()) {
                remove_entry(&to)?;
            }
            if !to.is_dir() {
                std::fs::create_dir(&to).map_err(|e| FimError::io(&to, e))?;
                std::fs::set_permissions(&to, meta.permissions())
                    .map_err(|e| FimError::io(&to, e))?;
            }
            merge_tree(&from, &to)?;
            continue;
        }

        if existing.is_some() {
            remove_entry(&to)?;
        }
        if meta.file_type().is_symlink() {
            let link = std::fs::read_link(&from).map_err(|e| FimError::io(&from, e))?;
            std::os::unix::fs::symlink(&link, &to).map_err(|e| FimError::io(&to, e))?;
        } else {
            let _ = std::fs::copy(&from, &to).map_err(|e| FimError::io(&to, e))?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.filter_map(std::result::Result::ok) {
        remove_entry(&entry.path())?;
    }
    Ok(())
}

fn remove_entry(path: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| FimError::io(path, e))?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path).map_err(|e| FimError::io(path, e))
    } else {
        std::fs::remove_file(path).map_err(|e| FimError::io(path, e))
    }
}

fn remove_tree(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::warn!(path = %path.display(), error = %e, "cannot remove staging directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::create_layer;

    struct Fixture {
        dir: tempfile::TempDir,
        count: usize,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().expect("tempdir"),
                count: 0,
            }
        }

        fn cache(&self) -> LayerCache {
            LayerCache::new(self.dir.path().join("cache"))
        }

        fn layer(&mut self, files: &[(&str, &str)]) -> LayerEntry {
            self.count += 1;
            let src = self.dir.path().join(format!("src{}", self.count));
            std::fs::create_dir_all(&src).expect("mkdir");
            for (path, content) in files {
                let path = src.join(path);
                std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
                std::fs::write(path, content).expect("write");
            }
            let file = self.dir.path().join(format!("{}.layer", self.count));
            let _ = create_layer(&src, &file, 6).expect("create");
            let size = std::fs::metadata(&file).expect("stat").len();
            LayerEntry {
                path: file,
                offset: 0,
                size,
            }
        }
    }

    #[test]
    fn materialize_is_idempotent() {
        let mut fx = Fixture::new();
        let layer = fx.layer(&[("etc/motd", "hello")]);
        let cache = fx.cache();
        let first = cache.materialize(&layer).expect("materialize");
        let second = cache.materialize(&layer).expect("materialize");
        assert_eq!(first, second);
        assert_eq!(
            std::fs::read_to_string(first.join("etc/motd")).expect("read"),
            "hello"
        );
    }

    #[test]
    fn layers_without_whiteouts_stay_separate() {
        let mut fx = Fixture::new();
        let layers = vec![fx.layer(&[("a", "1")]), fx.layer(&[("b", "2")])];
        let lowers = fx.cache().compose(&layers).expect("compose");
        assert_eq!(lowers.len(), 2);
    }

    #[test]
    fn whiteout_hides_lower_entry() {
        let mut fx = Fixture::new();
        let layers = vec![
            fx.layer(&[("etc/motd", "old"), ("etc/keep", "k")]),
            fx.layer(&[("etc/.wh.motd", "")]),
            fx.layer(&[("top", "t")]),
        ];
        let lowers = fx.cache().compose(&layers).expect("compose");
        assert_eq!(lowers.len(), 2);
        let composite = &lowers[0];
        assert!(!composite.join("etc/motd").exists());
        assert!(!composite.join("etc/.wh.motd").exists());
        assert!(composite.join("etc/keep").exists());
        assert!(lowers[1].join("top").exists());
    }

    #[test]
    fn opaque_marker_resets_directory() {
        let mut fx = Fixture::new();
        let layers = vec![
            fx.layer(&[("opt/old", "o"), ("other", "x")]),
            fx.layer(&[("opt/.wh..wh..opq", ""), ("opt/new", "n")]),
        ];
        let lowers = fx.cache().compose(&layers).expect("compose");
        assert_eq!(lowers.len(), 1);
        assert!(!lowers[0].join("opt/old").exists());
        assert!(lowers[0].join("opt/new").exists());
        assert!(lowers[0].join("other").exists());
    }

    #[test]
    fn prune_keeps_only_the_listed_entries() {
        let mut fx = Fixture::new();
        let old = fx.layer(&[("old", "o")]);
        let kept = vec![fx.layer(&[("a", "1")]), fx.layer(&[("b", "2"), (".wh.a", "")])];
        let cache = fx.cache();
        let stale = cache.materialize(&old).expect("materialize");
        let lowers = cache.compose(&kept).expect("compose");
        let staging = fx.dir.path().join("cache/.busy.1.partial");
        std::fs::create_dir_all(&staging).expect("mkdir");

        let mut keep = cache.entries_for(&kept).expect("entries");
        keep.extend_from_slice(&lowers);
        assert_eq!(cache.prune(&keep), 1);
        assert!(!stale.exists());
        assert!(staging.exists());
        assert!(keep.iter().all(|p| p.is_dir()));
        assert_eq!(cache.prune(&keep), 0);
    }

    #[test]
    fn same_layer_bytes_share_one_entry() {
        let mut fx = Fixture::new();
        let layer = fx.layer(&[("etc/motd", "hello")]);
        let copy = fx.dir.path().join("copy.layer");
        let _ = std::fs::copy(&layer.path, &copy).expect("copy");
        let moved = LayerEntry {
            path: copy,
            offset: 0,
            size: layer.size,
        };
        let cache = fx.cache();
        assert_eq!(
            cache.materialize(&layer).expect("materialize"),
            cache.materialize(&moved).expect("materialize")
        );
    }

    #[test]
    fn higher_layer_wins_same_path() {
        let mut fx = Fixture::new();
        let layers = vec![
            fx.layer(&[("conf", "low"), ("gone", "g")]),
            fx.layer(&[("conf", "high"), (".wh.gone", "")]),
        ];
        let lowers = fx.cache().compose(&layers).expect("compose");
        assert_eq!(
            std::fs::read_to_string(lowers[0].join("conf")).expect("read"),
            "high"
        );
    }
}
