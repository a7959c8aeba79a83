//! `fuse-overlayfs` backend.
//!
//! Stacks the read-only layers with the writable upper layer in user space,
//! for kernels where bubblewrap cannot mount overlayfs itself.

use std::ffi::OsString;

use fim_common::error::Result;
use fim_common::types::OverlayKind;

use super::fuse::FuseMount;
use super::{MergedRoot, MountStack, OverlayBackend, OverlayConfig, daemon_log};

/// Program names tried in order.
const PROGRAMS: &[&str] = &["fuse-overlayfs", "overlayfs"];

/// Backend spawning `fuse-overlayfs`.
#[derive(Debug, Clone, Copy)]
pub struct FuseOverlayfs {
    /// Owner reported for every file (`squash_to_uid`).
    pub uid: u32,
    /// Group reported for every file (`squash_to_gid`).
    pub gid: u32,
}

impl Default for FuseOverlayfs {
    fn default() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

impl FuseOverlayfs {
    /// Builds the daemon command line.
    ///
    /// `lowerdir=` lists layers top-down, so the highest-precedence layer
    /// comes first.
    #[must_use]
    pub fn args(&self, config: &OverlayConfig) -> Vec<OsString> {
        let lowers = config
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        vec![
            "-f".into(),
            "-o".into(),
            format!("squash_to_uid={}", self.uid).into(),
            "-o".into(),
            format!("squash_to_gid={}", self.gid).into(),
            "-o".into(),
            format!("lowerdir={lowers}").into(),
            "-o".into(),
            format!("upperdir={}", config.upper_dir.display()).into(),
            "-o".into(),
            format!("workdir={}", config.work_dir.display()).into(),
            config.merged_dir.clone().into_os_string(),
        ]
    }
}

impl OverlayBackend for FuseOverlayfs {
    fn kind(&self) -> OverlayKind {
        OverlayKind::Overlayfs
    }

    fn mount(&self, config: &OverlayConfig) -> Result<MergedRoot> {
        config.prepare()?;
        let mount = FuseMount::spawn(
            PROGRAMS,
            self.args(config),
            &config.merged_dir,
            &daemon_log(&config.log_dir, "overlayfs"),
        )?;
        Ok(MergedRoot::Mounted(MountStack {
            root: config.merged_dir.clone(),
            mounts: vec![mount],
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn lowerdir_lists_highest_layer_first() {
        let config = OverlayConfig {
            lower_dirs: vec!["/c/0".into(), "/c/1".into(), "/c/2".into()],
            upper_dir: "/d/upper".into(),
            work_dir: "/d/work".into(),
            merged_dir: "/d/mnt".into(),
            log_dir: PathBuf::from("/d/log"),
        };
        let args = FuseOverlayfs { uid: 1000, gid: 100 }.args(&config);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-f",
                "-o",
                "squash_to_uid=1000",
                "-o",
                "squash_to_gid=100",
                "-o",
                "lowerdir=/c/2:/c/1:/c/0",
                "-o",
                "upperdir=/d/upper",
                "-o",
                "workdir=/d/work",
                "/d/mnt",
            ]
        );
    }
}
