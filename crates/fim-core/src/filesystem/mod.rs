//! Overlay composition of the layer stack with the writable upper directory.
//!
//! Three interchangeable backends implement [`OverlayBackend`]:
//! - [`NativeBackend`]: nothing is mounted here; bubblewrap builds the overlay.
//! - [`overlayfs::FuseOverlayfs`]: a `fuse-overlayfs` daemon.
//! - [`unionfs::Unionfs`]: a `unionfs-fuse` daemon.
//!
//! The backend is chosen once through [`resolve_backend`] and [`backend_for`].
//! A bubblewrap overlay needs kernel overlayfs inside a user namespace; where
//! that is missing, [`fallback_backend`] switches to `unionfs`.
//! Every FUSE mount is owned by a guard, so teardown happens when the
//! returned [`MergedRoot`] is dropped.

pub mod ciopfs;
pub mod fuse;
pub mod overlayfs;
pub mod unionfs;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use fim_common::error::{FimError, Result};
use fim_common::types::OverlayKind;

use self::fuse::FuseMount;

/// Inputs of an overlay mount.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by overlay implementations.
    pub work_dir: PathBuf,
    /// Mount point for daemon-backed strategies.
    pub merged_dir: PathBuf,
    /// Directory receiving daemon logs.
    pub log_dir: PathBuf,
}

impl OverlayConfig {
    /// Creates the upper, work and merged directories.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created, or if there is
    /// no lower layer at all.
    pub fn prepare(&self) -> Result<()> {
        if self.lower_dirs.is_empty() {
            return Err(FimError::Mount {
                message: "no lower layers to compose".into(),
            });
        }
        for dir in [&self.upper_dir, &self.work_dir, &self.merged_dir] {
            std::fs::create_dir_all(dir).map_err(|e| FimError::io(dir, e))?;
        }
        Ok(())
    }
}

/// Overlay that bubblewrap mounts itself inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeOverlay {
    /// Lower layers, bottom to top.
    pub lower_dirs: Vec<PathBuf>,
    /// Upper layer.
    pub upper_dir: PathBuf,
    /// Overlay work directory.
    pub work_dir: PathBuf,
}

/// Stack of FUSE mounts, released top-down on drop.
#[derive(Debug)]
pub struct MountStack {
    root: PathBuf,
    mounts: Vec<FuseMount>,
}

impl MountStack {
    /// Directory presented as the sandbox root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for MountStack {
    fn drop(&mut self) {
        while let Some(mount) = self.mounts.pop() {
            drop(mount);
        }
    }
}

/// The composed root filesystem of one instance.
#[derive(Debug)]
pub enum MergedRoot {
    /// bubblewrap assembles the overlay from these directories.
    Native(NativeOverlay),
    /// A host-side FUSE mount (possibly stacked) provides the root.
    Mounted(MountStack),
}

impl MergedRoot {
    /// Stacks a case-insensitive `ciopfs` view over a mounted root.
    ///
    /// # Errors
    ///
    /// Returns [`FimError::Mount`] for native roots, which cannot be
    /// casefolded, or if `ciopfs` fails to mount.
    pub fn casefold(self, mountpoint: &Path, log_dir: &Path) -> Result<Self> {
        match self {
            Self::Native(_) => Err(FimError::Mount {
                message: "casefold requires a FUSE overlay backend".into(),
            }),
            Self::Mounted(mut stack) => {
                let mount = ciopfs::mount(&stack.root, mountpoint, log_dir)?;
                stack.root = mountpoint.to_path_buf();
                stack.mounts.push(mount);
                Ok(Self::Mounted(stack))
            }
        }
    }
}

/// A strategy for merging the layer stack with the upper directory.
pub trait OverlayBackend {
    /// Backend tag.
    fn kind(&self) -> OverlayKind;

    /// Composes `config.lower_dirs` with `config.upper_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be started or never mounts.
    fn mount(&self, config: &OverlayConfig) -> Result<MergedRoot>;
}

/// Backend that defers the overlay to bubblewrap.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl OverlayBackend for NativeBackend {
    fn kind(&self) -> OverlayKind {
        OverlayKind::Bwrap
    }

    fn mount(&self, config: &OverlayConfig) -> Result<MergedRoot> {
        config.prepare()?;
        tracing::debug!(layers = config.lower_dirs.len(), "using bwrap native overlay");
        Ok(MergedRoot::Native(NativeOverlay {
            lower_dirs: config.lower_dirs.clone(),
            upper_dir: config.upper_dir.clone(),
            work_dir: config.work_dir.clone(),
        }))
    }
}

/// Returns the backend implementation for `kind`.
#[must_use]
pub fn backend_for(kind: OverlayKind) -> Box<dyn OverlayBackend> {
    match kind {
        OverlayKind::Bwrap => Box::new(NativeBackend),
        OverlayKind::Overlayfs => Box::new(overlayfs::FuseOverlayfs::default()),
        OverlayKind::Unionfs => Box::new(unionfs::Unionfs),
    }
}

/// Resolves the overlay backend.
///
/// The persisted choice wins over the environment, which wins over the
/// bubblewrap default. Casefold cannot be layered over a native overlay, so
/// it forces `unionfs`.
#[must_use]
pub fn resolve_backend(
    recorded: Option<OverlayKind>,
    from_env: Option<OverlayKind>,
    casefold: bool,
) -> OverlayKind {
    let kind = recorded.or(from_env).unwrap_or_default();
    if casefold && kind == OverlayKind::Bwrap {
        tracing::warn!("casefold cannot be used with bwrap overlayfs, falling back to unionfs");
        return OverlayKind::Unionfs;
    }
    kind
}

/// Replaces a bubblewrap overlay with `unionfs` when `native_supported`
/// reports that the kernel cannot mount it. Other backends pass through and
/// the check is not run.
#[must_use]
pub fn fallback_backend(kind: OverlayKind, native_supported: impl FnOnce() -> bool) -> OverlayKind {
    if kind == OverlayKind::Bwrap && !native_supported() {
        tracing::warn!("bwrap overlayfs is not supported by this kernel, falling back to unionfs");
        return OverlayKind::Unionfs;
    }
    kind
}

/// Whether bubblewrap can mount a kernel overlay on this host.
///
/// Runs `true` in a throwaway sandbox with a temporary overlay built from
/// directories under `scratch`. A missing `bwrap` counts as unsupported.
#[must_use]
pub fn native_overlay_supported(scratch: &Path) -> bool {
    let Ok(bwrap) = fuse::find_program(&["bwrap"]) else {
        return false;
    };
    let lower = scratch.join("lower");
    let merged = scratch.join("merged");
    for dir in [&lower, &merged] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::debug!(path = %dir.display(), error = %e, "cannot prepare overlay check");
            return false;
        }
    }
    let status = Command::new(&bwrap)
        .args(["--dev-bind", "/", "/", "--overlay-src"])
        .arg(&lower)
        .arg("--tmp-overlay")
        .arg(&merged)
        .arg("true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) => {
            tracing::debug!(%status, "bwrap overlay check finished");
            status.success()
        }
        Err(e) => {
            tracing::debug!(error = %e, "cannot run bwrap overlay check");
            false
        }
    }
}

fn daemon_log(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{name}.log"))
}
