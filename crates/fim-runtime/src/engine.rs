//! Boot engine: composes the root filesystem and runs a program in the
//! sandbox.
//!
//! One boot resolves the layer stack, materializes it through the layer
//! cache, mounts it with the configured overlay backend, claims an instance
//! slot and runs bubblewrap until the sandboxed program exits. Every mount,
//! claim and per-instance directory is owned by a guard, so teardown happens
//! on all exit paths.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use fim_common::config::FimConfig;
use fim_common::constants::{DEFAULT_BOOT_PROGRAM, ENV_DIR_DATA, ENV_DIST};
use fim_common::error::{FimError, Result};
use fim_common::types::Token;
use fim_core::filesystem::{
    MergedRoot, OverlayConfig, backend_for, fallback_backend, native_overlay_supported,
    resolve_backend,
};
use fim_core::host::{HostEnv, expand_vars};
use fim_core::identity::{Identity, write_runtime_files};
use fim_core::sandbox::{BwrapCommand, SandboxBuilder};
use fim_image::cache::LayerCache;
use fim_image::store::LayerStore;

use crate::exec::exit_code;
use crate::instance::{InstanceClaim, InstanceRecord, InstanceRegistry};
use crate::records::{
    BindingRecord, BootRecord, CasefoldRecord, EnvironmentRecord, OverlayRecord,
    PermissionRecord, Records, UnshareRecord,
};

/// Variable pointing bash at the generated init file.
pub const ENV_BASHRC: &str = "BASHRC_FILE";

/// Registry index of the running instance, exported into the sandbox.
pub const ENV_INSTANCE: &str = "FIM_INSTANCE";

/// A program to run in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRequest {
    /// Program looked up inside the sandbox.
    pub program: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Run as root regardless of the configured identity.
    pub root: bool,
}

impl BootRequest {
    /// Runs `program` as the configured user.
    #[must_use]
    pub fn user(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            root: false,
        }
    }

    /// Runs `program` as root.
    #[must_use]
    pub fn root(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            root: true,
        }
    }
}

/// Boots sandboxes for one binary and data directory.
pub struct Engine<'a> {
    config: &'a FimConfig,
    host: &'a dyn HostEnv,
    records: Records,
}

impl<'a> Engine<'a> {
    /// Creates an engine over `config`, consulting `host` for identity and
    /// device lookups.
    #[must_use]
    pub fn new(config: &'a FimConfig, host: &'a dyn HostEnv) -> Self {
        Self {
            config,
            host,
            records: Records::new(config.records_dir()),
        }
    }

    /// The default boot: the recorded program (or `bash`) with the recorded
    /// arguments followed by `extra`.
    ///
    /// # Errors
    ///
    /// Returns an error if the boot record cannot be read.
    pub fn boot_request(&self, extra: &[String]) -> Result<BootRequest> {
        let boot: BootRecord = self.records.load()?;
        let mut args = boot.args;
        args.extend_from_slice(extra);
        Ok(BootRequest::user(
            boot.program
                .unwrap_or_else(|| DEFAULT_BOOT_PROGRAM.to_string()),
            args,
        ))
    }

    /// Runs `request` in a fresh sandbox and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the root filesystem cannot be composed or
    /// mounted, or bubblewrap cannot be started. The program's own failure is
    /// reported through the returned status, not as an error.
    pub fn run(&self, request: &BootRequest) -> Result<i32> {
        let pid = std::process::id();
        let _dirs = InstanceDirs::new(self.config, pid);
        let env: EnvironmentRecord = self.records.load()?;
        let identity = Identity::resolve(&env.0, request.root || self.config.root_env, self.host);

        let registry = InstanceRegistry::new(self.config.instances_dir());
        let mut claim = registry.claim(InstanceRecord::current(identity.uid, identity.gid))?;
        let root = self.mount_root(pid)?;

        let (reader, writer) = info_pipe()?;
        let sandbox = self.build_sandbox(&root, &identity, &env, &claim, writer.as_raw_fd(), request)?;
        let mut command = sandbox.command()?;

        if let Err(e) = ctrlc::set_handler(|| {}) {
            tracing::debug!(error = %e, "interrupt handler already installed");
        }
        tracing::info!(program = %request.program, root = identity.is_root(), "starting sandbox");
        let mut child = command.spawn().map_err(|e| FimError::Process {
            program: "bwrap".into(),
            message: e.to_string(),
        })?;
        drop(writer);

        match read_child_pid(reader) {
            Some(sandbox_pid) => {
                if let Err(e) = claim.set_sandbox_pid(sandbox_pid) {
                    tracing::warn!(error = %e, "cannot record sandbox pid");
                }
            }
            None => tracing::warn!("bwrap did not report the sandbox pid"),
        }

        let status = child.wait().map_err(|e| FimError::Process {
            program: "bwrap".into(),
            message: e.to_string(),
        })?;
        let code = exit_code(status);
        tracing::debug!(code, "sandbox exited");

        drop(claim);
        drop(root);
        Ok(code)
    }

    /// Composes and mounts the root filesystem for process `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be materialized or the backend
    /// fails to mount.
    pub fn mount_root(&self, pid: u32) -> Result<MergedRoot> {
        let casefold_record: CasefoldRecord = self.records.load()?;
        let overlay_record: OverlayRecord = self.records.load()?;
        let casefold = casefold_record.enabled || self.config.casefold_env;
        let kind = resolve_backend(overlay_record.kind, self.config.overlay_env, casefold);
        let kind = fallback_backend(kind, || {
            native_overlay_supported(&self.config.runtime_dir(pid).join("overlay-check"))
        });

        let mount_dir = self.config.mount_dir(pid);
        let log_dir = self.config.runtime_dir(pid).join("logs");
        let overlay = OverlayConfig {
            lower_dirs: self.lower_dirs()?,
            upper_dir: self.config.upper_dir(),
            work_dir: self.config.work_dir(pid),
            merged_dir: mount_dir.join("overlay"),
            log_dir: log_dir.clone(),
        };
        tracing::debug!(backend = %kind, layers = overlay.lower_dirs.len(), "mounting root");
        let root = backend_for(kind).mount(&overlay)?;
        if casefold {
            return root.casefold(&mount_dir.join("casefold"), &log_dir);
        }
        Ok(root)
    }

    /// Lower directories of the resolved stack, lowest first.
    ///
    /// An empty stack yields a single empty directory, so the upper layer
    /// alone forms the root. When no other instance is running, cache
    /// entries the stack no longer uses are removed.
    fn lower_dirs(&self) -> Result<Vec<PathBuf>> {
        let layers = LayerStore::new(self.config).enumerate()?;
        let cache = LayerCache::new(self.config.layer_cache_dir());
        let mut lowers = cache.compose(&layers)?;
        if lowers.is_empty() {
            let empty = self.config.layer_cache_dir().join("empty");
            std::fs::create_dir_all(&empty).map_err(|e| FimError::io(&empty, e))?;
            lowers.push(empty);
        }

        let mut keep = cache.entries_for(&layers)?;
        keep.extend_from_slice(&lowers);
        let registry = InstanceRegistry::new(self.config.instances_dir());
        match registry.if_sole_instance(|| cache.prune(&keep)) {
            Ok(Some(_)) => {}
            Ok(None) => tracing::debug!("other instances running, layer cache left as is"),
            Err(e) => tracing::warn!(error = %e, "cannot check instances before pruning the layer cache"),
        }
        Ok(lowers)
    }

    fn build_sandbox(
        &self,
        root: &MergedRoot,
        identity: &Identity,
        env: &EnvironmentRecord,
        claim: &InstanceClaim,
        info_fd: i32,
        request: &BootRequest,
    ) -> Result<BwrapCommand> {
        let runtime_dir = self.config.runtime_dir(std::process::id());
        let files = write_runtime_files(identity, &env.0, &runtime_dir)?;
        let permissions: PermissionRecord = self.records.load()?;
        let unshare: UnshareRecord = self.records.load()?;
        let bindings: BindingRecord = self.records.load()?;

        let mut builder = SandboxBuilder::new(self.host, root, identity, &files.passwd)
            .permissions(permissions.0)
            .unshare(unshare.0)
            .bindings(bindings.0)
            .info_fd(info_fd);
        for (key, value) in self.sandbox_env(&env.0, &files.bashrc, claim.index()) {
            builder = builder.env(key, value);
        }
        Ok(builder.build(&request.program, &request.args))
    }

    /// Variables added to the sandboxed program's environment.
    fn sandbox_env(
        &self,
        recorded: &BTreeMap<String, String>,
        bashrc: &Path,
        instance: usize,
    ) -> Vec<(String, String)> {
        let mut vars = vec![
            (ENV_DIST.to_string(), self.config.distribution.name().to_uppercase()),
            (
                ENV_DIR_DATA.to_string(),
                self.config.data_dir.display().to_string(),
            ),
            (ENV_INSTANCE.to_string(), instance.to_string()),
            (ENV_BASHRC.to_string(), bashrc.display().to_string()),
        ];
        vars.extend(
            recorded
                .iter()
                .map(|(k, v)| (k.clone(), expand_vars(v, self.host))),
        );
        vars
    }

}

/// Work, mount and runtime directories of one instance, removed on drop.
///
/// Created before the claim and the mounts, so it is dropped after both.
struct InstanceDirs<'a> {
    config: &'a FimConfig,
    pid: u32,
}

impl<'a> InstanceDirs<'a> {
    const fn new(config: &'a FimConfig, pid: u32) -> Self {
        Self { config, pid }
    }
}

impl Drop for InstanceDirs<'_> {
    fn drop(&mut self) {
        for dir in [
            self.config.work_dir(self.pid),
            self.config.mount_dir(self.pid),
            self.config.runtime_dir(self.pid),
        ] {
            if !dir.exists() {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "cannot remove instance directory");
            }
        }
    }
}

/// A pipe whose write end survives `exec` into bubblewrap.
fn info_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    let (reader, writer) = nix::unistd::pipe().map_err(|e| FimError::io("pipe", e.into()))?;
    let _ = fcntl(&reader, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| FimError::io("pipe", e.into()))?;
    Ok((reader, writer))
}

/// Reads bubblewrap's `--info-fd` report until it closes the pipe.
fn read_child_pid(reader: OwnedFd) -> Option<u32> {
    let mut raw = Vec::new();
    if let Err(e) = File::from(reader).read_to_end(&mut raw) {
        tracing::debug!(error = %e, "cannot read bwrap info");
        return None;
    }
    parse_child_pid(&raw)
}

fn parse_child_pid(raw: &[u8]) -> Option<u32> {
    let info: serde_json::Value = serde_json::from_slice(raw).ok()?;
    info.get("child-pid")?
        .as_u64()
        .and_then(|pid| u32::try_from(pid).ok())
}
