//! `fim-unshare`: Manage the namespaces unshared from the host.

use clap::Args;
use fim_common::config::FimConfig;
use fim_common::types::UnshareOption;

use super::{TokenOp, apply_token_op};

/// Arguments for the `fim-unshare` command.
#[derive(Args, Debug)]
pub struct UnshareArgs {
    /// Operation on the unshare set.
    #[command(subcommand)]
    pub op: TokenOp,
}

/// Executes the `fim-unshare` command.
///
/// # Errors
///
/// Returns an error for an unknown namespace or if the record cannot be
/// saved.
pub fn execute(args: UnshareArgs, config: &FimConfig) -> anyhow::Result<()> {
    apply_token_op::<UnshareOption>(args.op, config)
}
