//! Namespace and process inspection through procfs.
//!
//! Joining a running instance only enters the namespaces it does not
//! already share with the caller: `nsenter` refuses to re-enter the user
//! namespace it is already in.

use std::path::PathBuf;

use fim_common::error::{FimError, Result};

/// A Linux namespace type that `nsenter` can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// User namespace.
    User,
    /// Mount namespace.
    Mount,
    /// Hostname namespace.
    Uts,
    /// System V IPC namespace.
    Ipc,
    /// Network namespace.
    Net,
    /// PID namespace.
    Pid,
    /// Cgroup namespace.
    Cgroup,
}

impl Namespace {
    /// Every namespace, in the order `nsenter` should join them.
    pub const ALL: [Self; 7] = [
        Self::User,
        Self::Mount,
        Self::Uts,
        Self::Ipc,
        Self::Net,
        Self::Pid,
        Self::Cgroup,
    ];

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Cgroup => "cgroup",
        }
    }

    /// `nsenter` flag joining this namespace of the target.
    #[must_use]
    pub const fn nsenter_flag(self) -> &'static str {
        match self {
            Self::User => "--user",
            Self::Mount => "--mount",
            Self::Uts => "--uts",
            Self::Ipc => "--ipc",
            Self::Net => "--net",
            Self::Pid => "--pid",
            Self::Cgroup => "--cgroup",
        }
    }
}

/// Reads the namespace identity (e.g. `mnt:[4026531841]`) of `pid`, or of
/// the calling process when `pid` is `None`.
///
/// # Errors
///
/// Returns an error if the procfs link cannot be read.
pub fn namespace_id(pid: Option<u32>, ns: Namespace) -> Result<String> {
    let owner = pid.map_or_else(|| "self".to_string(), |p| p.to_string());
    let link = PathBuf::from(format!("/proc/{owner}/ns/{}", ns.proc_name()));
    let target = std::fs::read_link(&link).map_err(|e| FimError::io(&link, e))?;
    Ok(target.to_string_lossy().into_owned())
}

/// Namespaces of `pid` that differ from the caller's.
///
/// Namespaces the kernel does not expose are skipped.
///
/// # Errors
///
/// Returns an error if `pid` does not exist.
pub fn differing_namespaces(pid: u32) -> Result<Vec<Namespace>> {
    let root = PathBuf::from(format!("/proc/{pid}"));
    if !root.exists() {
        return Err(FimError::NotFound {
            kind: "process",
            id: pid.to_string(),
        });
    }
    let mut differing = Vec::new();
    for ns in Namespace::ALL {
        match (namespace_id(None, ns), namespace_id(Some(pid), ns)) {
            (Ok(ours), Ok(theirs)) if ours != theirs => differing.push(ns),
            (Ok(_), Ok(_)) => {}
            (_, Err(e)) | (Err(e), _) => {
                tracing::debug!(ns = ns.proc_name(), error = %e, "namespace not comparable");
            }
        }
    }
    Ok(differing)
}

/// Whether a process with `pid` currently exists.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).is_dir()
}

/// Start time of `pid` in clock ticks since boot (`/proc/<pid>/stat` field
/// 22). Together with the pid it identifies a process across pid reuse.
#[must_use]
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_ticks(&stat)
}

fn parse_start_ticks(stat: &str) -> Option<u64> {
    // The command name may itself contain spaces and parentheses.
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_ticks_skip_the_command_name() {
        let stat = "42 (we (ird) name) S 1 42 42 0 -1 4194560 100 0 0 0 3 1 0 0 20 0 1 0 98765 1000 10";
        assert_eq!(parse_start_ticks(stat), Some(98_765));
        assert_eq!(parse_start_ticks("42 (short) S 1"), None);
    }

    #[test]
    fn own_start_ticks_are_stable() {
        let me = std::process::id();
        let first = process_start_ticks(me).expect("own stat");
        assert_eq!(process_start_ticks(me), Some(first));
    }

    #[test]
    fn own_namespaces_never_differ() {
        let differing = differing_namespaces(std::process::id()).expect("inspect self");
        assert!(differing.is_empty(), "got {differing:?}");
    }

    #[test]
    fn mount_namespace_id_is_readable() {
        let id = namespace_id(None, Namespace::Mount).expect("read ns");
        assert!(id.starts_with("mnt:["), "got {id}");
    }

    #[test]
    fn liveness_follows_procfs() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn missing_process_is_not_found() {
        assert!(differing_namespaces(u32::MAX).is_err());
    }
}
