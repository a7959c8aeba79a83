//! `fim-instance`: List running instances or run a command inside one.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_runtime::exec::exec_in_instance;
use fim_runtime::instance::{Instance, InstanceRegistry};

/// Arguments for the `fim-instance` command.
#[derive(Args, Debug)]
pub struct InstanceArgs {
    #[command(subcommand)]
    op: InstanceOp,
}

#[derive(Subcommand, Debug)]
enum InstanceOp {
    /// Print `index:pid` per live instance.
    List,
    /// Run a command in the namespaces of an instance.
    Exec {
        /// Instance index as printed by `list`.
        id: String,
        /// Command and its arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
}

/// Executes the `fim-instance` command.
///
/// `exec` exits with the command's exit code.
///
/// # Errors
///
/// Returns an error for a bad id, a missing command, no matching instance,
/// or if the registry cannot be read.
pub fn execute(args: InstanceArgs, config: &FimConfig) -> anyhow::Result<()> {
    let registry = InstanceRegistry::new(config.instances_dir());
    match args.op {
        InstanceOp::List => {
            for line in list_lines(&registry.list()?) {
                println!("{line}");
            }
            Ok(())
        }
        InstanceOp::Exec { id, cmd } => {
            let code = exec_in_instance(&registry, &id, &cmd)?;
            std::process::exit(code);
        }
    }
}

fn list_lines(instances: &[Instance]) -> Vec<String> {
    instances
        .iter()
        .map(|i| format!("{}:{}", i.index, i.record.pid))
        .collect()
}
