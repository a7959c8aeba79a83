//! `fim-casefold`: Toggle case-insensitive lookups in the sandbox root.

use clap::{Args, ValueEnum};
use fim_common::config::FimConfig;
use fim_runtime::records::{CasefoldRecord, Records};

/// Arguments for the `fim-casefold` command.
#[derive(Args, Debug)]
pub struct CasefoldArgs {
    /// New state.
    pub state: Switch,
}

/// Casefold state.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Switch {
    /// Stack a case-insensitive view over the root.
    On,
    /// Use the root as is.
    Off,
}

/// Executes the `fim-casefold` command.
///
/// # Errors
///
/// Returns an error if the record cannot be saved.
pub fn execute(args: CasefoldArgs, config: &FimConfig) -> anyhow::Result<()> {
    let enabled = args.state == Switch::On;
    Records::new(config.records_dir()).save(&CasefoldRecord { enabled })?;
    tracing::info!(enabled, "casefold updated");
    Ok(())
}
