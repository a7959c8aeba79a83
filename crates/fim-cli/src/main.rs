//! # fim: single-file application images
//!
//! Boots a sandbox over the layers embedded in this executable, or runs one
//! of the reserved `fim-` commands that configure it.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;

use std::process::ExitCode;

use clap::Parser;
use fim_common::config::FimConfig;
use fim_common::constants::{COMMAND_PREFIX, ENV_DEBUG, EXIT_USAGE};
use fim_core::host::SystemHost;
use fim_runtime::engine::Engine;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> ExitCode {
    init_tracing();
    let argv: Vec<String> = std::env::args().collect();
    match run(&argv) {
        Ok(code) => exit_code(code),
        Err(e) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("fim: {e:#}");
            }
            exit_code(EXIT_USAGE)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(std::env::var(ENV_DEBUG).ok().as_deref())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Log level used when `RUST_LOG` is unset. The debug flag is read here,
/// before the configuration exists, so early failures are logged too.
fn default_level(debug: Option<&str>) -> &'static str {
    if debug == Some("1") { "debug" } else { "warn" }
}

fn run(argv: &[String]) -> anyhow::Result<i32> {
    let config = FimConfig::from_env()?;
    tracing::debug!(binary = %config.binary.display(), data = %config.data_dir.display(), "configuration resolved");

    if argv.get(1).is_some_and(|a| a.starts_with(COMMAND_PREFIX)) {
        let cli = match Cli::try_parse_from(argv) {
            Ok(cli) => cli,
            Err(e) => {
                let _ = e.print();
                return Ok(if e.use_stderr() { EXIT_USAGE } else { 0 });
            }
        };
        commands::execute(cli, &config)?;
        return Ok(0);
    }

    let host = SystemHost;
    let engine = Engine::new(&config, &host);
    let request = engine.boot_request(argv.get(1..).unwrap_or_default())?;
    Ok(engine.run(&request)?)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
