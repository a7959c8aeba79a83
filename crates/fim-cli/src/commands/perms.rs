//! `fim-perms`: Manage the host resources shared with the sandbox.

use clap::Args;
use fim_common::config::FimConfig;
use fim_common::types::Permission;

use super::{TokenOp, apply_token_op};

/// Arguments for the `fim-perms` command.
#[derive(Args, Debug)]
pub struct PermsArgs {
    /// Operation on the permission set.
    #[command(subcommand)]
    pub op: TokenOp,
}

/// Executes the `fim-perms` command.
///
/// # Errors
///
/// Returns an error for an unknown permission or if the record cannot be
/// saved.
pub fn execute(args: PermsArgs, config: &FimConfig) -> anyhow::Result<()> {
    apply_token_op::<Permission>(args.op, config)
}
