//! Per-invocation runtime configuration and data-directory layout.
//!
//! There is no long-lived daemon: every invocation resolves its
//! configuration from the running binary's location and the `FIM_*`
//! environment, then derives all on-disk paths from the data directory.

use std::path::{Path, PathBuf};

use crate::constants;
use crate::error::{FimError, Result};
use crate::types::{Distribution, OverlayKind, Token};

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct FimConfig {
    /// Path of the running executable that carries embedded layers.
    pub binary: PathBuf,
    /// Root of all mutable state for this binary.
    pub data_dir: PathBuf,
    /// Raw `FIM_LAYERS` value, if set.
    pub external_layers: Option<String>,
    /// Overlay backend requested through `FIM_OVERLAY`.
    pub overlay_env: Option<OverlayKind>,
    /// `FIM_CASEFOLD=1`.
    pub casefold_env: bool,
    /// `FIM_ROOT=1`.
    pub root_env: bool,
    /// Packaged distribution.
    pub distribution: Distribution,
    /// Gzip level for new layers (0-9).
    pub compression_level: u32,
}

impl FimConfig {
    /// Builds a configuration with defaults for everything except the
    /// binary and data directory.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            data_dir: data_dir.into(),
            external_layers: None,
            overlay_env: None,
            casefold_env: false,
            root_env: false,
            distribution: Distribution::Alpine,
            compression_level: constants::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Resolves the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the running executable cannot be located, or if
    /// `FIM_OVERLAY` / `FIM_DIST` hold an unknown value.
    pub fn from_env() -> Result<Self> {
        let binary = match std::env::var_os(constants::ENV_BINARY) {
            Some(p) => PathBuf::from(p),
            None => std::env::current_exe().map_err(|e| FimError::io("/proc/self/exe", e))?,
        };
        let data_dir = std::env::var_os(constants::ENV_DIR_DATA)
            .map_or_else(|| default_data_dir(&binary), PathBuf::from);

        let mut config = Self::new(binary, data_dir);
        config.external_layers = std::env::var(constants::ENV_LAYERS)
            .ok()
            .filter(|v| !v.is_empty());
        config.overlay_env = std::env::var(constants::ENV_OVERLAY)
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| OverlayKind::parse(&v))
            .transpose()?;
        config.casefold_env = env_flag(constants::ENV_CASEFOLD);
        config.root_env = env_flag(constants::ENV_ROOT);
        if let Ok(dist) = std::env::var(constants::ENV_DIST) {
            config.distribution = Distribution::parse(&dist)?;
        }
        config.compression_level = std::env::var(constants::ENV_COMPRESSION_LEVEL)
            .ok()
            .map_or(constants::DEFAULT_COMPRESSION_LEVEL, |v| {
                parse_compression_level(&v)
            });
        Ok(config)
    }

    /// Managed layer slots.
    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.data_dir.join("layers")
    }

    /// Writable upper directory shared by all instances.
    #[must_use]
    pub fn upper_dir(&self) -> PathBuf {
        self.data_dir.join("overlays").join("upperdir")
    }

    /// Per-process overlay work directory.
    #[must_use]
    pub fn work_dir(&self, pid: u32) -> PathBuf {
        self.data_dir
            .join("overlays")
            .join("workdir")
            .join(pid.to_string())
    }

    /// Instance registry directory.
    #[must_use]
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    /// Versioned JSON records.
    #[must_use]
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    /// Extracted layer cache.
    #[must_use]
    pub fn layer_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("layers")
    }

    /// Private mount points of one process.
    #[must_use]
    pub fn mount_dir(&self, pid: u32) -> PathBuf {
        self.data_dir.join("mount").join(pid.to_string())
    }

    /// Per-process runtime files (passwd, bashrc).
    #[must_use]
    pub fn runtime_dir(&self, pid: u32) -> PathBuf {
        self.data_dir.join("run").join(pid.to_string())
    }

    /// Downloaded recipes for the configured distribution.
    #[must_use]
    pub fn recipes_dir(&self) -> PathBuf {
        self.data_dir
            .join("recipes")
            .join(self.distribution.name())
            .join("latest")
    }

    /// Scratch space for in-progress writes.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Advisory lock guarding layer mutations.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join(".lock")
    }
}

/// Returns `<binary dir>/.<binary name>.config`.
#[must_use]
pub fn default_data_dir(binary: &Path) -> PathBuf {
    let name = binary
        .file_name()
        .map_or_else(|| constants::APP_NAME.into(), |n| n.to_string_lossy());
    binary
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{name}.config"))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

fn parse_compression_level(value: &str) -> u32 {
    match value.trim().parse::<u32>() {
        Ok(level) if level <= 9 => level,
        _ => {
            tracing::warn!(
                value,
                "invalid {}, using {}",
                constants::ENV_COMPRESSION_LEVEL,
                constants::DEFAULT_COMPRESSION_LEVEL
            );
            constants::DEFAULT_COMPRESSION_LEVEL
        }
    }
}
