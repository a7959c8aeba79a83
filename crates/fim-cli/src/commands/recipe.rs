//! `fim-recipe`: Fetch, inspect and install package recipes.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_core::host::SystemHost;
use fim_runtime::engine::{BootRequest, Engine};
use fim_runtime::recipe::{HttpSource, RecipeBook};
use fim_runtime::records::{Records, RemoteRecord};

use super::split_list;

/// Arguments for the `fim-recipe` command.
#[derive(Args, Debug)]
pub struct RecipeArgs {
    #[command(subcommand)]
    op: RecipeOp,
}

#[derive(Subcommand, Debug)]
enum RecipeOp {
    /// Download recipes and their dependencies from the remote.
    Fetch {
        /// Recipe names, separate or comma-separated.
        #[arg(required = true)]
        recipes: Vec<String>,
    },
    /// Print a summary of fetched recipes.
    Info {
        /// Recipe names, separate or comma-separated.
        #[arg(required = true)]
        recipes: Vec<String>,
    },
    /// Install the packages of recipes and their dependencies as root.
    Install {
        /// Recipe names, separate or comma-separated.
        #[arg(required = true)]
        recipes: Vec<String>,
    },
}

/// Executes the `fim-recipe` command.
///
/// `install` exits with the package manager's exit code.
///
/// # Errors
///
/// Returns an error if a recipe cannot be fetched or read, the
/// dependencies form a cycle, or the distribution has no package manager.
pub fn execute(args: RecipeArgs, config: &FimConfig) -> anyhow::Result<()> {
    let book = RecipeBook::new(config);
    let remote = Records::new(config.records_dir()).load::<RemoteRecord>()?.url;
    match args.op {
        RecipeOp::Fetch { recipes } => {
            let fetched = book.fetch(&HttpSource, remote.as_deref(), &split_list(&recipes), false)?;
            for name in fetched {
                println!("{}", book.path(&name).display());
            }
            Ok(())
        }
        RecipeOp::Info { recipes } => {
            for name in split_list(&recipes) {
                for line in book.info(&name)? {
                    println!("{line}");
                }
            }
            Ok(())
        }
        RecipeOp::Install { recipes } => {
            let order = book.fetch(&HttpSource, remote.as_deref(), &split_list(&recipes), true)?;
            let (program, args) = book.install_command(&order)?;
            tracing::info!(program = %program, recipes = ?order, "installing recipes");
            let host = SystemHost;
            let code = Engine::new(config, &host).run(&BootRequest::root(program, args))?;
            std::process::exit(code);
        }
    }
}
