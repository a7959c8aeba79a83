//! `fim-version`: Print version and helper program information.

use std::collections::BTreeMap;

use clap::{Args, ValueEnum};
use fim_core::filesystem::fuse::find_program;

/// Helper programs looked up at runtime.
const HELPERS: &[&str] = &[
    "bwrap",
    "fuse-overlayfs",
    "unionfs",
    "ciopfs",
    "nsenter",
    "fusermount",
];

/// Arguments for the `fim-version` command.
#[derive(Args, Debug)]
pub struct VersionArgs {
    /// What to print.
    #[arg(default_value = "short")]
    pub what: VersionKind,
}

/// Level of detail.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionKind {
    /// Version number only.
    Short,
    /// Version, target and build profile as JSON.
    Full,
    /// Resolved helper program paths as JSON.
    Deps,
}

/// Executes the `fim-version` command.
///
/// # Errors
///
/// Returns an error if the JSON output cannot be serialized.
pub fn execute(args: VersionArgs) -> anyhow::Result<()> {
    match args.what {
        VersionKind::Short => println!("{}", env!("CARGO_PKG_VERSION")),
        VersionKind::Full => println!("{}", serde_json::to_string_pretty(&full())?),
        VersionKind::Deps => println!("{}", serde_json::to_string_pretty(&deps())?),
    }
    Ok(())
}

fn full() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("name", env!("CARGO_PKG_NAME")),
        ("version", env!("CARGO_PKG_VERSION")),
        ("arch", std::env::consts::ARCH),
        ("os", std::env::consts::OS),
        (
            "profile",
            if cfg!(debug_assertions) { "debug" } else { "release" },
        ),
    ])
}

fn deps() -> BTreeMap<&'static str, Option<String>> {
    HELPERS
        .iter()
        .map(|name| {
            let path = find_program(&[*name])
                .ok()
                .map(|p| p.display().to_string());
            (*name, path)
        })
        .collect()
}
