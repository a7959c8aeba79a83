//! Namespace joining for executing commands in running instances.

use std::ffi::OsString;
use std::process::{Command, ExitStatus};

use fim_common::error::{FimError, Result};
use fim_core::filesystem::fuse::find_program;
use fim_core::namespace::differing_namespaces;

use crate::instance::{InstanceRecord, InstanceRegistry};

/// Runs `cmd` inside instance `id` and returns its exit status.
///
/// `id` is validated before the registry is consulted, so a malformed
/// request fails the same way whether or not anything is running.
///
/// # Errors
///
/// Returns a usage error for a malformed id, an empty command, an empty
/// registry or an unknown index. Returns an error if `nsenter` cannot be
/// started.
pub fn exec_in_instance<S: AsRef<str>>(
    registry: &InstanceRegistry,
    id: &str,
    cmd: &[S],
) -> Result<i32> {
    let index = parse_instance_id(id)?;
    if cmd.is_empty() {
        return Err(FimError::usage("Missing 'cmd' argument for 'fim-instance'"));
    }
    let instances = registry.list()?;
    if instances.is_empty() {
        return Err(FimError::usage("No instances are running"));
    }
    let instance = instances
        .iter()
        .find(|i| i.index == index)
        .ok_or_else(|| FimError::usage("Instance index out of bounds"))?;

    let args = nsenter_args(&instance.record, cmd)?;
    tracing::info!(index, args = ?args, "exec into instance");
    let nsenter = find_program(&["nsenter"])?;
    let status = Command::new(nsenter)
        .args(&args)
        .status()
        .map_err(|e| FimError::Process {
            program: "nsenter".into(),
            message: e.to_string(),
        })?;
    Ok(exit_code(status))
}

/// Parses an instance id argument.
///
/// # Errors
///
/// Returns a usage error unless `id` is a non-negative integer.
pub fn parse_instance_id(id: &str) -> Result<usize> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FimError::usage(format!("Invalid instance ID '{id}'")));
    }
    id.parse()
        .map_err(|_| FimError::usage(format!("Invalid instance ID '{id}'")))
}

/// `nsenter` arguments joining the namespaces of `record` that differ from
/// the caller's.
///
/// # Errors
///
/// Returns an error if the sandbox has not reported its pid yet or is gone.
pub fn nsenter_args<S: AsRef<str>>(record: &InstanceRecord, cmd: &[S]) -> Result<Vec<OsString>> {
    let target = record.sandbox_pid.ok_or_else(|| FimError::Config {
        message: format!("instance of pid {} has not started its sandbox yet", record.pid),
    })?;
    let mut args: Vec<OsString> = vec!["--target".into(), target.to_string().into()];
    args.extend(
        differing_namespaces(target)?
            .into_iter()
            .map(|ns| OsString::from(ns.nsenter_flag())),
    );
    args.extend([
        "--setuid".into(),
        record.uid.to_string().into(),
        "--setgid".into(),
        record.gid.to_string().into(),
        "--".into(),
    ]);
    args.extend(cmd.iter().map(|c| OsString::from(c.as_ref())));
    Ok(args)
}

/// Exit code of a finished child: its own code, or `128 + signal` when it
/// was killed.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(fim_common::constants::EXIT_USAGE)
}
