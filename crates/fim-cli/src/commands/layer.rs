//! `fim-layer` / `fim-commit`: Create, register and commit layers.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_common::error::FimError;
use fim_image::commit::commit as commit_upper;
use fim_image::layer::create_layer;
use fim_image::store::{LayerStore, LayerTarget};

/// Arguments for the `fim-layer` command.
#[derive(Args, Debug)]
pub struct LayerArgs {
    #[command(subcommand)]
    op: LayerOp,
}

#[derive(Subcommand, Debug)]
enum LayerOp {
    /// Pack a directory into a layer file.
    Create {
        /// Directory to pack.
        src: PathBuf,
        /// Layer file to write.
        dst: PathBuf,
    },
    /// Register an existing layer file.
    Add {
        /// Layer file.
        file: PathBuf,
        /// Where to register it: `binary` (default), `layer` or `file`.
        #[arg(default_value = "binary")]
        mode: String,
        /// Destination path, required by `file`.
        path: Option<PathBuf>,
    },
    /// Pack the upper directory into a new layer.
    Commit(CommitArgs),
    /// Print `index:offset:size:path` per layer, lowest precedence first.
    List,
}

/// Arguments for `fim-layer commit` and `fim-commit`.
#[derive(Args, Debug)]
pub struct CommitArgs {
    /// `binary`, `layer` or `file`.
    pub mode: String,
    /// Destination path, required by `file`.
    pub path: Option<PathBuf>,
}

/// Parses a `binary|layer|file <path>` destination.
///
/// # Errors
///
/// Returns a usage error for an unknown mode, a `file` mode without a
/// path, or a path given to another mode.
pub fn parse_target(mode: &str, path: Option<PathBuf>) -> Result<LayerTarget, FimError> {
    match (mode, path) {
        ("binary", None) => Ok(LayerTarget::Binary),
        ("layer", None) => Ok(LayerTarget::Managed),
        ("file", Some(path)) => Ok(LayerTarget::File(path)),
        ("file", None) => Err(FimError::usage("Missing path for 'file' layer target")),
        ("binary" | "layer", Some(path)) => Err(FimError::usage(format!(
            "Unexpected path '{}' for '{mode}' layer target",
            path.display()
        ))),
        (other, _) => Err(FimError::usage(format!("Invalid layer target '{other}'"))),
    }
}

/// Executes the `fim-layer` command.
///
/// # Errors
///
/// Returns an error if the layer operation fails.
pub fn execute(args: LayerArgs, config: &FimConfig) -> anyhow::Result<()> {
    match args.op {
        LayerOp::Create { src, dst } => {
            let packed = create_layer(&src, &dst, config.compression_level)?;
            tracing::info!(entries = packed.len(), dst = %dst.display(), "layer created");
        }
        LayerOp::Add { file, mode, path } => {
            let target = parse_target(&mode, path)?;
            let dest = LayerStore::new(config).add(&file, &target)?;
            tracing::info!(to = %target, dest = %dest.display(), "layer added");
        }
        LayerOp::Commit(args) => commit(args, config)?,
        LayerOp::List => {
            for line in LayerStore::new(config).list()? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Executes `fim-layer commit` and its `fim-commit` alias.
///
/// # Errors
///
/// Returns an error for a bad target, when no slot is left, or if packing
/// the upper directory fails.
pub fn commit(args: CommitArgs, config: &FimConfig) -> anyhow::Result<()> {
    let target = parse_target(&args.mode, args.path)?;
    let dest = commit_upper(config, &target)?;
    tracing::info!(to = %target, dest = %dest.display(), "upper layer committed");
    Ok(())
}
