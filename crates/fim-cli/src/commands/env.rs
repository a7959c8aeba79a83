//! `fim-env`: Manage variables exported into the sandbox.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_runtime::records::{EnvironmentRecord, Records};

/// Arguments for the `fim-env` command.
#[derive(Args, Debug)]
pub struct EnvArgs {
    #[command(subcommand)]
    op: EnvOp,
}

#[derive(Subcommand, Debug)]
enum EnvOp {
    /// Add or replace `KEY=VALUE` entries.
    Add {
        /// Entries; values may reference `$VAR` from the host.
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Replace all variables with `KEY=VALUE` entries.
    Set {
        /// Entries; values may reference `$VAR` from the host.
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Remove variables by key.
    Del {
        /// Keys to remove.
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print `KEY=VALUE` lines.
    List,
    /// Remove every variable.
    Clear,
}

/// Executes the `fim-env` command.
///
/// # Errors
///
/// Returns an error for an entry without `=` or if the record cannot be
/// saved.
pub fn execute(args: EnvArgs, config: &FimConfig) -> anyhow::Result<()> {
    let records = Records::new(config.records_dir());
    match args.op {
        EnvOp::Add { entries } => {
            let _ = records.update::<EnvironmentRecord>(|r| r.add(&entries))?;
        }
        EnvOp::Set { entries } => {
            let _ = records.update::<EnvironmentRecord>(|r| r.set(&entries))?;
        }
        EnvOp::Del { keys } => {
            let _ = records.update::<EnvironmentRecord>(|r| {
                r.del(&keys);
                Ok(())
            })?;
        }
        EnvOp::List => {
            for line in records.load::<EnvironmentRecord>()?.lines() {
                println!("{line}");
            }
        }
        EnvOp::Clear => records.save(&EnvironmentRecord::default())?,
    }
    Ok(())
}
