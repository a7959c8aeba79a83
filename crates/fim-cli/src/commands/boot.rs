//! `fim-boot`: Configure the program run when no command is given.

use clap::{Args, Subcommand};
use fim_common::config::FimConfig;
use fim_common::constants::DEFAULT_BOOT_PROGRAM;
use fim_runtime::records::{BootRecord, Records};

/// Arguments for the `fim-boot` command.
#[derive(Args, Debug)]
pub struct BootArgs {
    #[command(subcommand)]
    op: BootOp,
}

#[derive(Subcommand, Debug)]
enum BootOp {
    /// Set the boot program and its leading arguments.
    Set {
        /// Program looked up inside the sandbox.
        program: String,
        /// Arguments placed before the caller's arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the boot program and arguments.
    Show,
    /// Restore the default boot program.
    Clear,
}

/// Executes the `fim-boot` command.
///
/// # Errors
///
/// Returns an error if the boot record cannot be read or written.
pub fn execute(args: BootArgs, config: &FimConfig) -> anyhow::Result<()> {
    let records = Records::new(config.records_dir());
    match args.op {
        BootOp::Set { program, args } => {
            records.save(&BootRecord {
                program: Some(program),
                args,
            })?;
        }
        BootOp::Show => {
            let record: BootRecord = records.load()?;
            let program = record.program.as_deref().unwrap_or(DEFAULT_BOOT_PROGRAM);
            println!("{}", show_line(program, &record.args));
        }
        BootOp::Clear => records.save(&BootRecord::default())?,
    }
    Ok(())
}

fn show_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
