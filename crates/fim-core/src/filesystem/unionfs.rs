//! `unionfs-fuse` backend.
//!
//! Copy-on-write union where the upper directory is the only writable
//! branch. Required for casefold, since `ciopfs` must sit on a host-visible
//! mount.

use std::ffi::OsString;

use fim_common::error::Result;
use fim_common::types::OverlayKind;

use super::fuse::FuseMount;
use super::{MergedRoot, MountStack, OverlayBackend, OverlayConfig, daemon_log};

/// Backend spawning `unionfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unionfs;

impl Unionfs {
    /// Builds the daemon command line.
    ///
    /// Branches are listed top-down: the writable upper first, then layers
    /// from highest to lowest precedence.
    #[must_use]
    pub fn args(config: &OverlayConfig) -> Vec<OsString> {
        let mut branches = format!("{}=RW", config.upper_dir.display());
        for lower in config.lower_dirs.iter().rev() {
            branches.push_str(&format!(":{}=RO", lower.display()));
        }
        vec![
            "-f".into(),
            "-o".into(),
            "cow".into(),
            branches.into(),
            config.merged_dir.clone().into_os_string(),
        ]
    }
}

impl OverlayBackend for Unionfs {
    fn kind(&self) -> OverlayKind {
        OverlayKind::Unionfs
    }

    fn mount(&self, config: &OverlayConfig) -> Result<MergedRoot> {
        config.prepare()?;
        let mount = FuseMount::spawn(
            &["unionfs", "unionfs-fuse"],
            Self::args(config),
            &config.merged_dir,
            &daemon_log(&config.log_dir, "unionfs"),
        )?;
        Ok(MergedRoot::Mounted(MountStack {
            root: config.merged_dir.clone(),
            mounts: vec![mount],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_branch_is_first_and_writable() {
        let config = OverlayConfig {
            lower_dirs: vec!["/c/base".into(), "/c/app".into()],
            upper_dir: "/d/upper".into(),
            work_dir: "/d/work".into(),
            merged_dir: "/d/mnt".into(),
            log_dir: "/d/log".into(),
        };
        let args: Vec<String> = Unionfs::args(&config)
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-f",
                "-o",
                "cow",
                "/d/upper=RW:/c/app=RO:/c/base=RO",
                "/d/mnt"
            ]
        );
    }
}
