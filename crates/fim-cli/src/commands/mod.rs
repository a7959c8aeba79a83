//! CLI command definitions and dispatch.
//!
//! Every reserved command starts with `fim-`, so it cannot collide with the
//! arguments of the packaged program. Anything else boots the default
//! program.

pub mod bind;
pub mod boot;
pub mod casefold;
pub mod env;
pub mod exec;
pub mod instance;
pub mod layer;
pub mod overlay;
pub mod perms;
pub mod recipe;
pub mod remote;
pub mod unshare;
pub mod version;

use clap::{Parser, Subcommand};
use fim_common::config::FimConfig;
use fim_common::types::{Selection, Token};
use fim_runtime::records::{Record, Records, TokenSet};

/// fim: single-file application packager.
#[derive(Parser, Debug)]
#[command(name = "fim", version, about, long_about = None)]
pub struct Cli {
    /// Reserved command to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Reserved commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a program in the sandbox as the configured user.
    #[command(name = "fim-exec")]
    Exec(exec::ExecArgs),
    /// Run a program in the sandbox as root.
    #[command(name = "fim-root")]
    Root(exec::ExecArgs),
    /// Manage granted permissions.
    #[command(name = "fim-perms")]
    Perms(perms::PermsArgs),
    /// Manage unshared namespaces.
    #[command(name = "fim-unshare")]
    Unshare(unshare::UnshareArgs),
    /// Manage user bind mounts.
    #[command(name = "fim-bind")]
    Bind(bind::BindArgs),
    /// Manage sandbox environment variables.
    #[command(name = "fim-env")]
    Env(env::EnvArgs),
    /// Configure the default boot command.
    #[command(name = "fim-boot")]
    Boot(boot::BootArgs),
    /// Select the overlay backend.
    #[command(name = "fim-overlay")]
    Overlay(overlay::OverlayArgs),
    /// Toggle case-insensitive filesystem lookups.
    #[command(name = "fim-casefold")]
    Casefold(casefold::CasefoldArgs),
    /// Create, add, commit and list layers.
    #[command(name = "fim-layer")]
    Layer(layer::LayerArgs),
    /// Commit the upper layer (alias of `fim-layer commit`).
    #[command(name = "fim-commit")]
    Commit(layer::CommitArgs),
    /// List or join running instances.
    #[command(name = "fim-instance")]
    Instance(instance::InstanceArgs),
    /// Fetch, inspect and install package recipes.
    #[command(name = "fim-recipe")]
    Recipe(recipe::RecipeArgs),
    /// Configure the recipe remote.
    #[command(name = "fim-remote")]
    Remote(remote::RemoteArgs),
    /// Show version information.
    #[command(name = "fim-version")]
    Version(version::VersionArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli, config: &FimConfig) -> anyhow::Result<()> {
    match cli.command {
        Command::Exec(args) => exec::execute(args, config, false),
        Command::Root(args) => exec::execute(args, config, true),
        Command::Perms(args) => perms::execute(args, config),
        Command::Unshare(args) => unshare::execute(args, config),
        Command::Bind(args) => bind::execute(args, config),
        Command::Env(args) => env::execute(args, config),
        Command::Boot(args) => boot::execute(args, config),
        Command::Overlay(args) => overlay::execute(args, config),
        Command::Casefold(args) => casefold::execute(args, config),
        Command::Layer(args) => layer::execute(args, config),
        Command::Commit(args) => layer::commit(args, config),
        Command::Instance(args) => instance::execute(args, config),
        Command::Recipe(args) => recipe::execute(args, config),
        Command::Remote(args) => remote::execute(args, config),
        Command::Version(args) => version::execute(args),
    }
}

/// Operations shared by the token-set records (`fim-perms`, `fim-unshare`).
#[derive(Subcommand, Debug)]
pub enum TokenOp {
    /// Add tokens to the set.
    Add {
        /// Tokens, separate or comma-separated.
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Remove tokens from the set.
    Del {
        /// Tokens, separate or comma-separated.
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Replace the set.
    Set {
        /// Tokens, separate or comma-separated.
        #[arg(required = true)]
        tokens: Vec<String>,
    },
    /// Print the set, one token per line.
    List,
    /// Empty the set.
    Clear,
}

/// Applies `op` to the token-set record of `T`.
///
/// Tokens are validated before the record is touched.
///
/// # Errors
///
/// Returns an error for an invalid token or if the record cannot be saved.
pub fn apply_token_op<T>(op: TokenOp, config: &FimConfig) -> anyhow::Result<()>
where
    T: Token,
    TokenSet<T>: Record,
{
    let records = Records::new(config.records_dir());
    match op {
        TokenOp::Add { tokens } => {
            let selection = Selection::<T>::parse(&tokens)?;
            let _ = records.update::<TokenSet<T>>(|set| {
                set.add(selection);
                Ok(())
            })?;
        }
        TokenOp::Del { tokens } => {
            let selection = Selection::<T>::parse(&tokens)?;
            let _ = records.update::<TokenSet<T>>(|set| {
                set.del(selection);
                Ok(())
            })?;
        }
        TokenOp::Set { tokens } => {
            let selection = Selection::<T>::parse(&tokens)?;
            let _ = records.update::<TokenSet<T>>(|set| {
                set.set(selection);
                Ok(())
            })?;
        }
        TokenOp::List => {
            for name in records.load::<TokenSet<T>>()?.names() {
                println!("{name}");
            }
        }
        TokenOp::Clear => records.save(&TokenSet::<T>::default())?,
    }
    Ok(())
}

/// Splits arguments that may themselves be comma-separated lists.
#[must_use]
pub fn split_list(args: &[String]) -> Vec<String> {
    args.iter()
        .flat_map(|a| a.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
