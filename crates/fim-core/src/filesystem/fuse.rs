//! FUSE daemon lifecycle.
//!
//! A [`FuseMount`] owns one foreground FUSE daemon. Spawning blocks until the
//! kernel reports a FUSE filesystem at the mount point; dropping the guard
//! lazily unmounts it and reaps the daemon. Daemons also receive `SIGTERM`
//! through `PR_SET_PDEATHSIG` if the owning process dies without unwinding.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use fim_common::constants::{FUSE_MOUNT_TIMEOUT_SECS, FUSE_SUPER_MAGIC};
use fim_common::error::{FimError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Returns `true` when `path` is the root of a FUSE filesystem.
///
/// # Errors
///
/// Returns an error if `statfs(2)` fails on `path`.
#[cfg(target_os = "linux")]
pub fn is_fuse(path: &Path) -> Result<bool> {
    let stat = nix::sys::statfs::statfs(path).map_err(|e| FimError::io(path, e.into()))?;
    Ok(i64::from(stat.filesystem_type().0) == FUSE_SUPER_MAGIC)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: FUSE detection requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn is_fuse(_path: &Path) -> Result<bool> {
    Err(FimError::Config {
        message: "Linux required for FUSE mounts".into(),
    })
}

/// Locates the first available program among `candidates` in `PATH`.
///
/// # Errors
///
/// Returns [`FimError::NotFound`] if none of the candidates is installed.
pub fn find_program(candidates: &[&str]) -> Result<PathBuf> {
    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| FimError::NotFound {
            kind: "program",
            id: candidates.join(" or "),
        })
}

/// A mounted FUSE filesystem and the daemon serving it.
#[derive(Debug)]
pub struct FuseMount {
    mountpoint: PathBuf,
    program: String,
    child: Option<Child>,
}

impl FuseMount {
    /// Spawns a foreground FUSE daemon and waits until it has mounted.
    ///
    /// The daemon's stdout and stderr are appended to `log_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be located or spawned, exits
    /// before mounting, or does not mount within the readiness timeout.
    pub fn spawn(
        candidates: &[&str],
        args: Vec<OsString>,
        mountpoint: &Path,
        log_file: &Path,
    ) -> Result<Self> {
        let program = find_program(candidates)?;
        std::fs::create_dir_all(mountpoint).map_err(|e| FimError::io(mountpoint, e))?;
        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FimError::io(parent, e))?;
        }
        let log = File::options()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| FimError::io(log_file, e))?;
        let log_err = log.try_clone().map_err(|e| FimError::io(log_file, e))?;

        let mut command = Command::new(&program);
        let _ = command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        die_with_parent(&mut command);

        tracing::debug!(program = %program.display(), ?args, "spawning fuse daemon");
        let child = command.spawn().map_err(|e| FimError::io(&program, e))?;

        let mut mount = Self {
            mountpoint: mountpoint.to_path_buf(),
            program: program.display().to_string(),
            child: Some(child),
        };
        mount.wait_ready(Duration::from_secs(FUSE_MOUNT_TIMEOUT_SECS))?;
        tracing::info!(mountpoint = %mount.mountpoint.display(), program = %mount.program, "fuse filesystem mounted");
        Ok(mount)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child
                    .try_wait()
                    .map_err(|e| FimError::io(&self.mountpoint, e))?
                {
                    self.child = None;
                    return Err(FimError::Mount {
                        message: format!(
                            "{} exited with {status} before mounting {}",
                            self.program,
                            self.mountpoint.display()
                        ),
                    });
                }
            }
            if is_fuse(&self.mountpoint)? {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(FimError::Mount {
                    message: format!(
                        "timed out waiting for {} to mount {}",
                        self.program,
                        self.mountpoint.display()
                    ),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for FuseMount {
    fn drop(&mut self) {
        match find_program(&["fusermount", "fusermount3"]) {
            Ok(fusermount) => {
                let status = Command::new(fusermount)
                    .arg("-zu")
                    .arg(&self.mountpoint)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                if !status.is_ok_and(|s| s.success()) {
                    tracing::warn!(mountpoint = %self.mountpoint.display(), "fusermount failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot unmount fuse filesystem"),
        }
        if let Some(mut child) = self.child.take() {
            terminate(&mut child);
        }
        tracing::debug!(mountpoint = %self.mountpoint.display(), "fuse filesystem released");
    }
}

#[cfg(target_os = "linux")]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(child.id()) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
    }
    let _ = child.wait();
}

#[cfg(not(target_os = "linux"))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Arranges for the spawned process to receive `SIGTERM` when this
/// process exits.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn die_with_parent(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the closure runs between fork and exec and only issues the
    // async-signal-safe prctl(2) syscall.
    unsafe {
        let _ = command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
                .map_err(std::io::Error::from)
        });
    }
}

/// No-op on non-Linux platforms.
#[cfg(not(target_os = "linux"))]
pub fn die_with_parent(_command: &mut Command) {}
