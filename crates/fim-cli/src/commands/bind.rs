//! `fim-bind`: Manage host paths bound into the sandbox.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_common::types::{BindType, Binding};
use fim_runtime::records::{BindingRecord, Records};

/// Arguments for the `fim-bind` command.
#[derive(Args, Debug)]
pub struct BindArgs {
    #[command(subcommand)]
    op: BindOp,
}

#[derive(Subcommand, Debug)]
enum BindOp {
    /// Append a binding.
    Add {
        /// Mount kind: `ro`, `rw` or `dev`.
        #[arg(value_parser = parse_bind_type)]
        kind: BindType,
        /// Host path, may reference `$VAR`.
        src: String,
        /// Path inside the sandbox, may reference `$VAR`.
        dst: String,
    },
    /// Remove the binding at an index; later bindings move down.
    Del {
        /// Index as printed by `fim-bind list`.
        index: usize,
    },
    /// Print `index:type:src:dst` lines.
    List,
}

fn parse_bind_type(s: &str) -> Result<BindType, String> {
    s.parse().map_err(|e: fim_common::error::FimError| e.to_string())
}

/// Executes the `fim-bind` command.
///
/// # Errors
///
/// Returns an error for an unknown index or if the record cannot be
/// saved.
pub fn execute(args: BindArgs, config: &FimConfig) -> anyhow::Result<()> {
    let records = Records::new(config.records_dir());
    match args.op {
        BindOp::Add { kind, src, dst } => {
            let record = records.update::<BindingRecord>(|r| {
                r.0.push(Binding { kind, src, dst });
                Ok(())
            })?;
            tracing::info!(index = record.0.len() - 1, "binding added");
        }
        BindOp::Del { index } => {
            let _ = records.update::<BindingRecord>(|r| r.remove(index).map(|_| ()))?;
        }
        BindOp::List => {
            for line in list_lines(&records.load()?) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn list_lines(record: &BindingRecord) -> Vec<String> {
    record
        .0
        .iter()
        .enumerate()
        .map(|(i, b)| format!("{i}:{}:{}:{}", b.kind, b.src, b.dst))
        .collect()
}
