//! `fim-overlay`: Select the overlay backend.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_common::types::OverlayKind;
use fim_core::filesystem::resolve_backend;
use fim_runtime::records::{CasefoldRecord, OverlayRecord, Records};

/// Arguments for the `fim-overlay` command.
#[derive(Args, Debug)]
pub struct OverlayArgs {
    #[command(subcommand)]
    op: OverlayOp,
}

#[derive(Subcommand, Debug)]
enum OverlayOp {
    /// Persist a backend: `bwrap`, `overlayfs` or `unionfs`.
    Set {
        /// Backend name.
        #[arg(value_parser = parse_kind)]
        kind: OverlayKind,
    },
    /// Print the backend the next boot will use.
    Show,
}

fn parse_kind(s: &str) -> Result<OverlayKind, String> {
    s.parse().map_err(|e: fim_common::error::FimError| e.to_string())
}

/// Executes the `fim-overlay` command.
///
/// # Errors
///
/// Returns an error if a record cannot be read or written.
pub fn execute(args: OverlayArgs, config: &FimConfig) -> anyhow::Result<()> {
    let records = Records::new(config.records_dir());
    match args.op {
        OverlayOp::Set { kind } => records.save(&OverlayRecord { kind: Some(kind) })?,
        OverlayOp::Show => {
            let recorded = records.load::<OverlayRecord>()?.kind;
            let casefold = records.load::<CasefoldRecord>()?.enabled || config.casefold_env;
            println!("{}", resolve_backend(recorded, config.overlay_env, casefold));
        }
    }
    Ok(())
}
