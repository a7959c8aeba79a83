//! `fim-remote`: Configure where recipes are fetched from.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_common::error::FimError;
use fim_runtime::records::{Records, RemoteRecord};

/// Arguments for the `fim-remote` command.
#[derive(Args, Debug)]
pub struct RemoteArgs {
    #[command(subcommand)]
    op: RemoteOp,
}

#[derive(Subcommand, Debug)]
enum RemoteOp {
    /// Set the remote base URL.
    Set {
        /// Base URL.
        url: String,
    },
    /// Print the remote base URL.
    Show,
    /// Forget the remote.
    Clear,
}

/// Executes the `fim-remote` command.
///
/// # Errors
///
/// Returns an error if no remote is configured on `show`, or if the record
/// cannot be read or written.
pub fn execute(args: RemoteArgs, config: &FimConfig) -> anyhow::Result<()> {
    let records = Records::new(config.records_dir());
    match args.op {
        RemoteOp::Set { url } => records.save(&RemoteRecord { url: Some(url) })?,
        RemoteOp::Show => {
            let url = records
                .load::<RemoteRecord>()?
                .url
                .ok_or_else(|| FimError::usage("No remote URL configured"))?;
            println!("{url}");
        }
        RemoteOp::Clear => records.save(&RemoteRecord::default())?,
    }
    Ok(())
}
