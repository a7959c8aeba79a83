//! Sandbox user identity and the `/etc/passwd` and bashrc synthesized for it.
//!
//! Overrides come from the persisted environment record (`UID`, `GID`,
//! `USER`, `HOME`, `SHELL`, `PS1`). Root mode wins over every override.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fim_common::constants::DEFAULT_SHELL;
use fim_common::error::{FimError, Result};

use crate::host::HostEnv;

/// Prompt written when the environment record has no `PS1`.
pub const DEFAULT_PS1: &str = r"[flatimage-${FIM_DIST,,}] \W > ";

/// User the sandboxed program runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Numeric user id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Login name.
    pub name: String,
    /// Home directory.
    pub home: PathBuf,
    /// Login shell.
    pub shell: PathBuf,
}

impl Identity {
    /// Resolves the identity from record overrides and the host.
    ///
    /// Non-numeric `UID`/`GID` overrides fall back to the host ids. A uid of
    /// zero, whether forced or overridden, yields the root account with gid 0.
    pub fn resolve(overrides: &BTreeMap<String, String>, root: bool, host: &dyn HostEnv) -> Self {
        let numeric = |key: &str| overrides.get(key).and_then(|v| v.trim().parse::<u32>().ok());
        let (uid, gid) = if root {
            (0, 0)
        } else {
            (
                numeric("UID").unwrap_or_else(|| host.uid()),
                numeric("GID").unwrap_or_else(|| host.gid()),
            )
        };
        let shell = overrides
            .get("SHELL")
            .map_or_else(|| PathBuf::from(DEFAULT_SHELL), PathBuf::from);

        if uid == 0 {
            return Self {
                uid,
                gid: 0,
                name: "root".into(),
                home: PathBuf::from("/root"),
                shell,
            };
        }

        let account = host.account();
        let name = overrides
            .get("USER")
            .cloned()
            .or_else(|| host.var("USER"))
            .or_else(|| account.as_ref().map(|(n, _)| n.clone()))
            .unwrap_or_else(|| uid.to_string());
        let home = overrides
            .get("HOME")
            .map(PathBuf::from)
            .or_else(|| host.var("HOME").map(PathBuf::from))
            .or_else(|| account.map(|(_, h)| h))
            .unwrap_or_else(|| PathBuf::from("/home").join(&name));
        Self {
            uid,
            gid,
            name,
            home,
            shell,
        }
    }

    /// Whether this identity is the superuser.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// The `/etc/passwd` line for this identity.
    #[must_use]
    pub fn passwd_entry(&self) -> String {
        format!(
            "{name}:x:{uid}:{gid}:{name}:{home}:{shell}",
            name = self.name,
            uid = self.uid,
            gid = self.gid,
            home = self.home.display(),
            shell = self.shell.display()
        )
    }
}

/// Files generated for one instance.
#[derive(Debug, Clone)]
pub struct RuntimeFiles {
    /// Synthesized `/etc/passwd`.
    pub passwd: PathBuf,
    /// Bash init file exporting `PS1`.
    pub bashrc: PathBuf,
}

/// Writes the passwd and bashrc files of `identity` into `dir`.
///
/// # Errors
///
/// Returns an error if `dir` cannot be created or a file cannot be written.
pub fn write_runtime_files(
    identity: &Identity,
    overrides: &BTreeMap<String, String>,
    dir: &Path,
) -> Result<RuntimeFiles> {
    std::fs::create_dir_all(dir).map_err(|e| FimError::io(dir, e))?;

    let passwd = dir.join("passwd");
    std::fs::write(&passwd, format!("{}\n", identity.passwd_entry()))
        .map_err(|e| FimError::io(&passwd, e))?;

    let bashrc = dir.join("bashrc");
    let ps1 = overrides.get("PS1").map_or(DEFAULT_PS1, String::as_str);
    std::fs::write(&bashrc, format!("export PS1=\"{ps1}\"\n"))
        .map_err(|e| FimError::io(&bashrc, e))?;

    tracing::debug!(user = %identity.name, uid = identity.uid, gid = identity.gid, "runtime identity written");
    Ok(RuntimeFiles { passwd, bashrc })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedHost;

    fn record(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn host() -> FixedHost {
        FixedHost::new(1000, 100)
            .with_var("USER", "ana")
            .with_var("HOME", "/home/ana")
    }

    #[test]
    fn defaults_follow_the_host() {
        let id = Identity::resolve(&BTreeMap::new(), false, &host());
        assert_eq!(
            id.passwd_entry(),
            "ana:x:1000:100:ana:/home/ana:/bin/bash"
        );
    }

    #[test]
    fn numeric_overrides_replace_host_ids() {
        let id = Identity::resolve(
            &record(&[("UID", "1234"), ("GID", "55"), ("USER", "app"), ("HOME", "/app")]),
            false,
            &host(),
        );
        assert_eq!((id.uid, id.gid), (1234, 55));
        assert_eq!(id.name, "app");
        assert_eq!(id.home, PathBuf::from("/app"));
    }

    #[test]
    fn non_numeric_ids_fall_back_to_host() {
        let id = Identity::resolve(&record(&[("UID", "abc"), ("GID", "")]), false, &host());
        assert_eq!((id.uid, id.gid), (1000, 100));
    }

    #[test]
    fn root_mode_ignores_every_override() {
        let id = Identity::resolve(
            &record(&[("UID", "1234"), ("GID", "55"), ("USER", "app"), ("HOME", "/app")]),
            true,
            &host(),
        );
        assert_eq!(id.passwd_entry(), "root:x:0:0:root:/root:/bin/bash");
    }

    #[test]
    fn uid_zero_override_is_root() {
        let id = Identity::resolve(&record(&[("UID", "0")]), false, &host());
        assert!(id.is_root());
        assert_eq!(id.name, "root");
    }

    #[test]
    fn uid_zero_override_discards_the_gid_override() {
        let id = Identity::resolve(&record(&[("UID", "0"), ("GID", "55")]), false, &host());
        assert_eq!(id.passwd_entry(), "root:x:0:0:root:/root:/bin/bash");
    }

    #[test]
    fn account_database_is_last_resort() {
        let mut bare = FixedHost::new(1001, 1001);
        bare.account = Some(("bo".into(), PathBuf::from("/srv/bo")));
        let id = Identity::resolve(&BTreeMap::new(), false, &bare);
        assert_eq!(id.name, "bo");
        assert_eq!(id.home, PathBuf::from("/srv/bo"));
    }

    #[test]
    fn runtime_files_carry_prompt_and_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = Identity::resolve(&BTreeMap::new(), false, &host());
        let files = write_runtime_files(&id, &record(&[("PS1", "box> ")]), dir.path())
            .expect("write");
        let passwd = std::fs::read_to_string(files.passwd).expect("read passwd");
        assert_eq!(passwd.trim_end(), id.passwd_entry());
        let bashrc = std::fs::read_to_string(files.bashrc).expect("read bashrc");
        assert_eq!(bashrc.trim_end(), "export PS1=\"box> \"");
    }

    #[test]
    fn default_prompt_names_the_distribution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = Identity::resolve(&BTreeMap::new(), false, &host());
        let files = write_runtime_files(&id, &BTreeMap::new(), dir.path()).expect("write");
        let bashrc = std::fs::read_to_string(files.bashrc).expect("read bashrc");
        assert!(bashrc.contains("${FIM_DIST,,}"));
    }
}
