//! System-wide constants: environment variable names, on-disk layout, limits.

/// Application name used in version output and default prompts.
pub const APP_NAME: &str = "fim";

/// Prefix shared by every reserved subcommand.
pub const COMMAND_PREFIX: &str = "fim-";

/// Exit status for usage, validation and internal errors.
pub const EXIT_USAGE: i32 = 125;

/// Overrides the data directory.
pub const ENV_DIR_DATA: &str = "FIM_DIR_DATA";
/// Colon-separated list of external layer files or directories.
pub const ENV_LAYERS: &str = "FIM_LAYERS";
/// Overlay backend override (`bwrap`, `overlayfs`, `unionfs`).
pub const ENV_OVERLAY: &str = "FIM_OVERLAY";
/// Enables case-insensitive lookups when set to `1`.
pub const ENV_CASEFOLD: &str = "FIM_CASEFOLD";
/// Forces root identity when set to `1`.
pub const ENV_ROOT: &str = "FIM_ROOT";
/// Enables debug logging when set to `1`.
pub const ENV_DEBUG: &str = "FIM_DEBUG";
/// Distribution of the packaged root filesystem.
pub const ENV_DIST: &str = "FIM_DIST";
/// Gzip level used when creating layers.
pub const ENV_COMPRESSION_LEVEL: &str = "FIM_COMPRESSION_LEVEL";
/// Overrides the path of the running binary.
pub const ENV_BINARY: &str = "FIM_BINARY";

/// Default gzip level for new layers.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 7;

/// Program run when no boot command is configured.
pub const DEFAULT_BOOT_PROGRAM: &str = "bash";

/// Shell written to `/etc/passwd` when none is configured.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Highest managed layer slot number.
pub const MAX_LAYER_SLOT: u32 = 999;

/// Prefix of managed layer slot file names.
pub const LAYER_SLOT_PREFIX: &str = "layer-";

/// Suffix of managed layer slot file names.
pub const LAYER_SLOT_SUFFIX: &str = ".layer";

/// `statfs(2)` magic of FUSE filesystems.
pub const FUSE_SUPER_MAGIC: i64 = 0x6573_5546;

/// Seconds to wait for a FUSE daemon to come up.
pub const FUSE_MOUNT_TIMEOUT_SECS: u64 = 60;

/// Returns the managed slot file name for `slot`, e.g. `layer-007.layer`.
#[must_use]
pub fn layer_slot_name(slot: u32) -> String {
    format!("{LAYER_SLOT_PREFIX}{slot:03}{LAYER_SLOT_SUFFIX}")
}

/// Parses a managed slot file name back into its number.
///
/// Accepts exactly the names [`layer_slot_name`] produces: three digits,
/// at most [`MAX_LAYER_SLOT`]. Anything else yields `None`.
#[must_use]
pub fn parse_layer_slot(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(LAYER_SLOT_PREFIX)?
        .strip_suffix(LAYER_SLOT_SUFFIX)?;
    if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|slot| *slot <= MAX_LAYER_SLOT)
}
