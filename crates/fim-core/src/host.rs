//! Read-only view of the invoking host.
//!
//! Sandbox construction consults host environment variables, the user
//! database and device nodes. [`HostEnv`] puts those lookups behind one seam
//! so argument construction can be exercised against a [`FixedHost`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Host facts consulted while building a sandbox.
pub trait HostEnv {
    /// Value of an environment variable, if set and valid UTF-8.
    fn var(&self, key: &str) -> Option<String>;

    /// Real uid of the calling process.
    fn uid(&self) -> u32;

    /// Real gid of the calling process.
    fn gid(&self) -> u32;

    /// Login name and home directory of [`HostEnv::uid`] in the user database.
    fn account(&self) -> Option<(String, PathBuf)>;

    /// Whether `path` exists.
    fn exists(&self, path: &Path) -> bool;

    /// Entries of `/dev` whose file name starts with `prefix`, sorted.
    fn dev_entries(&self, prefix: &str) -> Vec<PathBuf>;
}

/// The real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostEnv for SystemHost {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn uid(&self) -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn gid(&self) -> u32 {
        nix::unistd::getgid().as_raw()
    }

    fn account(&self) -> Option<(String, PathBuf)> {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| (user.name, user.dir))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn dev_entries(&self, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .map(|e| e.path())
            .collect();
        found.sort();
        found
    }
}

/// A host with fixed answers.
#[derive(Debug, Clone, Default)]
pub struct FixedHost {
    /// Environment variables.
    pub vars: BTreeMap<String, String>,
    /// Reported uid.
    pub uid: u32,
    /// Reported gid.
    pub gid: u32,
    /// Reported user database entry.
    pub account: Option<(String, PathBuf)>,
    /// Paths that exist.
    pub paths: BTreeSet<PathBuf>,
}

impl FixedHost {
    /// A host running as `uid`/`gid` with no variables and no devices.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            ..Self::default()
        }
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        let _ = self.vars.insert(key.into(), value.into());
        self
    }

    /// Marks `path` as existing.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        let _ = self.paths.insert(path.into());
        self
    }
}

impl HostEnv for FixedHost {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    fn gid(&self) -> u32 {
        self.gid
    }

    fn account(&self) -> Option<(String, PathBuf)> {
        self.account.clone()
    }

    fn exists(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    fn dev_entries(&self, prefix: &str) -> Vec<PathBuf> {
        self.paths
            .iter()
            .filter(|p| p.parent() == Some(Path::new("/dev")))
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(prefix))
            })
            .cloned()
            .collect()
    }
}

/// Expands `$NAME` and `${NAME}` references from the host environment.
///
/// Unset variables expand to the empty string. A `$` not followed by a
/// variable name is kept literally.
pub fn expand_vars(input: &str, host: &dyn HostEnv) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        if name.is_empty() {
            out.push('$');
            rest = after;
        } else {
            out.push_str(&host.var(name).unwrap_or_default());
            rest = &after[consumed..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_plain_and_braced_references() {
        let host = FixedHost::new(1000, 1000).with_var("HOME", "/home/ana");
        assert_eq!(expand_vars("$HOME/docs", &host), "/home/ana/docs");
        assert_eq!(expand_vars("${HOME}x", &host), "/home/anax");
    }

    #[test]
    fn unset_variables_expand_to_nothing() {
        let host = FixedHost::new(0, 0);
        assert_eq!(expand_vars("/a/$NOPE/b", &host), "/a//b");
    }

    #[test]
    fn lone_dollar_is_literal() {
        let host = FixedHost::new(0, 0);
        assert_eq!(expand_vars("cost: 5$", &host), "cost: 5$");
        assert_eq!(expand_vars("$-x", &host), "$-x");
    }

    #[test]
    fn fixed_host_lists_dev_entries_by_prefix() {
        let host = FixedHost::new(0, 0)
            .with_path("/dev/nvidia0")
            .with_path("/dev/nvidiactl")
            .with_path("/dev/dri");
        assert_eq!(
            host.dev_entries("nvidia"),
            vec![PathBuf::from("/dev/nvidia0"), PathBuf::from("/dev/nvidiactl")]
        );
    }
}
