//! bubblewrap command construction.
//!
//! [`SandboxBuilder`] turns a composed root, an identity and the persisted
//! permission, unshare and binding records into the full `bwrap` argument
//! vector. Argument order matters to bubblewrap: the root comes first so
//! that every later bind lands on top of it.

mod permissions;

use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Command;

use fim_common::error::Result;
use fim_common::types::{BindType, Binding, Permission, UnshareOption};

use crate::filesystem::MergedRoot;
use crate::filesystem::fuse::find_program;
use crate::host::{HostEnv, expand_vars};
use crate::identity::Identity;

pub use self::permissions::APPLY_ORDER;
use self::permissions::PermissionArgs;

/// bubblewrap flag unsharing `option`.
#[must_use]
pub const fn unshare_flag(option: UnshareOption) -> &'static str {
    match option {
        UnshareOption::User => "--unshare-user",
        UnshareOption::Ipc => "--unshare-ipc",
        UnshareOption::Pid => "--unshare-pid",
        UnshareOption::Net => "--unshare-net",
        UnshareOption::Uts => "--unshare-uts",
        UnshareOption::Cgroup => "--unshare-cgroup-try",
    }
}

/// bubblewrap flag for a user binding of `kind`.
#[must_use]
pub const fn bind_flag(kind: BindType) -> &'static str {
    match kind {
        BindType::Dev => "--dev-bind-try",
        BindType::Ro => "--ro-bind-try",
        BindType::Rw => "--bind-try",
    }
}

/// A fully constructed bubblewrap invocation.
#[derive(Debug, Clone)]
pub struct BwrapCommand {
    /// Arguments passed to `bwrap`, program included.
    pub args: Vec<OsString>,
    /// Variables added to the child environment.
    pub env: Vec<(String, String)>,
}

impl BwrapCommand {
    /// Builds a [`Command`] running `bwrap` with these arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if `bwrap` is not installed.
    pub fn command(&self) -> Result<Command> {
        let bwrap = find_program(&["bwrap"])?;
        let mut command = Command::new(bwrap);
        let _ = command.args(&self.args).envs(self.env.iter().cloned());
        Ok(command)
    }
}

/// Assembles a [`BwrapCommand`].
pub struct SandboxBuilder<'a> {
    host: &'a dyn HostEnv,
    root: &'a MergedRoot,
    identity: &'a Identity,
    passwd: PathBuf,
    permissions: BTreeSet<Permission>,
    unshare: BTreeSet<UnshareOption>,
    bindings: Vec<Binding>,
    env: Vec<(String, String)>,
    info_fd: Option<i32>,
}

impl<'a> SandboxBuilder<'a> {
    /// Starts a sandbox over `root` running as `identity`.
    pub fn new(
        host: &'a dyn HostEnv,
        root: &'a MergedRoot,
        identity: &'a Identity,
        passwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            root,
            identity,
            passwd: passwd.into(),
            permissions: BTreeSet::new(),
            unshare: BTreeSet::new(),
            bindings: Vec::new(),
            env: Vec::new(),
            info_fd: None,
        }
    }

    /// Grants host resources.
    #[must_use]
    pub fn permissions(mut self, permissions: BTreeSet<Permission>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Unshares namespaces from the host.
    #[must_use]
    pub fn unshare(mut self, unshare: BTreeSet<UnshareOption>) -> Self {
        self.unshare = unshare;
        self
    }

    /// Adds user-declared bind mounts.
    #[must_use]
    pub fn bindings(mut self, bindings: Vec<Binding>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Adds a variable to the child environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Asks bubblewrap to report the sandboxed pid on `fd`.
    #[must_use]
    pub const fn info_fd(mut self, fd: i32) -> Self {
        self.info_fd = Some(fd);
        self
    }

    /// Produces the invocation running `program` with `args`.
    #[must_use]
    pub fn build<S: AsRef<str>>(self, program: &str, args: &[S]) -> BwrapCommand {
        let mut out = ArgVec::default();

        match self.root {
            MergedRoot::Native(native) => {
                for layer in &native.lower_dirs {
                    let _ = out.push("--overlay-src").push(layer);
                }
                let _ = out
                    .push("--overlay")
                    .push(&native.upper_dir)
                    .push(&native.work_dir)
                    .push("/");
            }
            MergedRoot::Mounted(stack) => {
                let _ = out.push("--bind").push(stack.root()).push("/");
            }
        }

        for arg in [
            "--dev", "/dev", "--proc", "/proc", "--bind", "/tmp", "/tmp", "--bind", "/sys", "/sys",
            "--bind-try", "/etc/group", "/etc/group",
        ] {
            let _ = out.push(arg);
        }
        let _ = out.push("--bind-try").push(&self.passwd).push("/etc/passwd");

        let identity = self.identity;
        let _ = out
            .push("--uid")
            .push(identity.uid.to_string())
            .push("--gid")
            .push(identity.gid.to_string());
        let _ = out.push("--setenv").push("USER").push(&identity.name);
        let _ = out.push("--setenv").push("HOME").push(&identity.home);
        let _ = out.push("--setenv").push("SHELL").push(&identity.shell);

        let xdg_runtime_dir = self
            .host
            .var("XDG_RUNTIME_DIR")
            .filter(|v| !v.is_empty())
            .map_or_else(
                || PathBuf::from(format!("/run/user/{}", self.host.uid())),
                PathBuf::from,
            );
        let _ = out.push("--setenv").push("XDG_RUNTIME_DIR").push(&xdg_runtime_dir);

        for option in &self.unshare {
            let _ = out.push(unshare_flag(*option));
        }

        let mut granted = PermissionArgs {
            host: self.host,
            xdg_runtime_dir: &xdg_runtime_dir,
            is_root: identity.is_root(),
            args: Vec::new(),
        };
        for permission in APPLY_ORDER.iter().filter(|p| self.permissions.contains(*p)) {
            granted.apply(*permission);
        }
        out.0.extend(granted.args);

        for binding in &self.bindings {
            let src = expand_vars(&binding.src, self.host);
            let dst = expand_vars(&binding.dst, self.host);
            tracing::debug!(kind = %binding.kind, src = %src, dst = %dst, "user binding");
            let _ = out.push(bind_flag(binding.kind)).push(src).push(dst);
        }

        let _ = out.push("--die-with-parent");
        if let Some(fd) = self.info_fd {
            let _ = out.push("--info-fd").push(fd.to_string());
        }
        let _ = out.push(program);
        for arg in args {
            let _ = out.push(arg.as_ref());
        }

        let mut env = vec![
            ("TERM".to_string(), "xterm".to_string()),
            (
                "XDG_RUNTIME_DIR".to_string(),
                xdg_runtime_dir.display().to_string(),
            ),
        ];
        env.extend(self.env);
        BwrapCommand { args: out.0, env }
    }
}

#[derive(Default)]
struct ArgVec(Vec<OsString>);

impl ArgVec {
    fn push(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.0.push(arg.as_ref().to_owned());
        self
    }
}
