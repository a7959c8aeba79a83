//! `fim-exec` / `fim-root`: Run a program inside the sandbox.

use clap::Args;
use fim_common::config::FimConfig;
use fim_core::host::SystemHost;
use fim_runtime::engine::{BootRequest, Engine};

/// Arguments for the `fim-exec` and `fim-root` commands.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Program looked up inside the sandbox.
    pub program: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Executes the `fim-exec` command, or `fim-root` when `root` is set.
///
/// The process exits with the program's exit code.
///
/// # Errors
///
/// Returns an error if the sandbox cannot be set up.
pub fn execute(args: ExecArgs, config: &FimConfig, root: bool) -> anyhow::Result<()> {
    let request = if root {
        BootRequest::root(args.program, args.args)
    } else {
        BootRequest::user(args.program, args.args)
    };
    let host = SystemHost;
    let code = Engine::new(config, &host).run(&request)?;
    std::process::exit(code);
}
