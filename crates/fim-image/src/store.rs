//! Layer Store: resolution and registration of read-only layers.
//!
//! The stack is, in increasing precedence:
//! 1. layers embedded in the binary, in offset order;
//! 2. managed slots `layer-000.layer` .. `layer-999.layer`, by number;
//! 3. `FIM_LAYERS` entries, where a directory expands to its files sorted by
//!    name.
//!
//! Bad external entries are warned about and skipped, never fatal.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fim_common::config::FimConfig;
use fim_common::constants::{MAX_LAYER_SLOT, layer_slot_name, parse_layer_slot};
use fim_common::error::{FimError, Result};

use crate::embedded;
use crate::layer::{is_layer_file, tmp_path};
use crate::lock::DataLock;

/// One resolved layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    /// File holding the layer.
    pub path: PathBuf,
    /// Offset of the layer inside `path`; zero for standalone files.
    pub offset: u64,
    /// Size of the layer in bytes.
    pub size: u64,
}

impl LayerEntry {
    /// Opens a reader over exactly this layer's bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be opened or seeked.
    pub fn open(&self) -> Result<std::io::Take<File>> {
        let mut file = File::open(&self.path).map_err(|e| FimError::io(&self.path, e))?;
        let _ = file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| FimError::io(&self.path, e))?;
        Ok(file.take(self.size))
    }

    fn standalone(path: PathBuf) -> Result<Self> {
        let size = std::fs::metadata(&path)
            .map_err(|e| FimError::io(&path, e))?
            .len();
        Ok(Self {
            path,
            offset: 0,
            size,
        })
    }
}

/// Destination of a new layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerTarget {
    /// Appended to the running binary.
    Binary,
    /// Copied to the next free managed slot.
    Managed,
    /// Copied to a caller-chosen path that must not exist yet.
    File(PathBuf),
}

impl fmt::Display for LayerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Managed => f.write_str("layer"),
            Self::File(path) => write!(f, "file '{}'", path.display()),
        }
    }
}

/// Resolves and registers layers of one binary and data directory.
#[derive(Debug)]
pub struct LayerStore<'a> {
    config: &'a FimConfig,
}

impl<'a> LayerStore<'a> {
    /// Creates a store over `config`.
    #[must_use]
    pub const fn new(config: &'a FimConfig) -> Self {
        Self { config }
    }

    /// Resolves the full layer stack, lowest precedence first.
    ///
    /// # Errors
    ///
    /// Returns an error if the managed layer directory exists but cannot be
    /// read.
    pub fn enumerate(&self) -> Result<Vec<LayerEntry>> {
        let mut stack = self.embedded();
        for (_, path) in self.managed_slots()? {
            if is_layer_file(&path) {
                stack.push(LayerEntry::standalone(path)?);
            } else {
                tracing::warn!(path = %path.display(), "managed slot is not a layer, skipping");
            }
        }
        if let Some(list) = &self.config.external_layers {
            stack.extend(external_layers(list));
        }
        tracing::debug!(count = stack.len(), "layer stack resolved");
        Ok(stack)
    }

    /// One `index:offset:size:path` line per resolved layer.
    ///
    /// # Errors
    ///
    /// See [`LayerStore::enumerate`].
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .enumerate()?
            .iter()
            .enumerate()
            .map(|(i, l)| format!("{i}:{}:{}:{}", l.offset, l.size, l.path.display()))
            .collect())
    }

    /// Number of the next free managed slot.
    ///
    /// # Errors
    ///
    /// Returns [`FimError::LayerSlotsExhausted`] when it would exceed the
    /// highest slot.
    pub fn next_slot(&self) -> Result<u32> {
        let next = self
            .managed_slots()?
            .last()
            .map_or(0, |(slot, _)| slot + 1);
        if next > MAX_LAYER_SLOT {
            return Err(FimError::LayerSlotsExhausted);
        }
        Ok(next)
    }

    /// Registers the layer file `layer` at `target`, under the layer lock.
    ///
    /// Returns the path now holding the layer.
    ///
    /// # Errors
    ///
    /// Returns a usage error if `layer` is missing or not a layer, or if a
    /// file target already exists. Returns
    /// [`FimError::LayerSlotsExhausted`] when no managed slot is left.
    pub fn add(&self, layer: &Path, target: &LayerTarget) -> Result<PathBuf> {
        let _lock = DataLock::acquire(&self.config.lock_file())?;
        self.add_locked(layer, target)
    }

    /// Checks that `target` can receive a layer, without writing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary is not an ELF64 image, no managed
    /// slot is left, or a file target already exists.
    pub(crate) fn check_target(&self, target: &LayerTarget) -> Result<()> {
        match target {
            LayerTarget::Binary => embedded::elf_end(&self.config.binary).map(|_| ()),
            LayerTarget::Managed => self.next_slot().map(|_| ()),
            LayerTarget::File(path) => ensure_absent(path),
        }
    }

    /// Same as [`LayerStore::add`]; the caller must hold the layer lock.
    pub(crate) fn add_locked(&self, layer: &Path, target: &LayerTarget) -> Result<PathBuf> {
        if !layer.exists() {
            return Err(FimError::usage(format!(
                "Layer file '{}' does not exist",
                layer.display()
            )));
        }
        if !is_layer_file(layer) {
            return Err(FimError::usage(format!(
                "'{}' is not a layer",
                layer.display()
            )));
        }
        let destination = match target {
            LayerTarget::Binary => {
                embedded::append_embedded(&self.config.binary, layer)?;
                self.config.binary.clone()
            }
            LayerTarget::Managed => {
                let dir = self.config.layers_dir();
                std::fs::create_dir_all(&dir).map_err(|e| FimError::io(&dir, e))?;
                let path = dir.join(layer_slot_name(self.next_slot()?));
                copy_into_place(layer, &path)?;
                path
            }
            LayerTarget::File(path) => {
                ensure_absent(path)?;
                copy_into_place(layer, path)?;
                path.clone()
            }
        };
        tracing::info!(layer = %layer.display(), kind = %target, destination = %destination.display(), "layer added");
        Ok(destination)
    }

    fn embedded(&self) -> Vec<LayerEntry> {
        let binary = &self.config.binary;
        if !binary.exists() {
            tracing::debug!(binary = %binary.display(), "binary not found, no embedded layers");
            return Vec::new();
        }
        match embedded::read_embedded(binary) {
            Ok(layers) => layers
                .into_iter()
                .map(|l| LayerEntry {
                    path: binary.clone(),
                    offset: l.offset,
                    size: l.size,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(binary = %binary.display(), error = %e, "cannot read embedded layers");
                Vec::new()
            }
        }
    }

    fn managed_slots(&self) -> Result<Vec<(u32, PathBuf)>> {
        let dir = self.config.layers_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FimError::io(&dir, e)),
        };
        let mut slots: Vec<(u32, PathBuf)> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|e| {
                let slot = parse_layer_slot(&e.file_name().to_string_lossy())?;
                Some((slot, e.path()))
            })
            .collect();
        slots.sort();
        Ok(slots)
    }
}

/// Expands a colon-separated `FIM_LAYERS` value into layers.
fn external_layers(list: &str) -> Vec<LayerEntry> {
    let mut found = Vec::new();
    for raw in list.split(':').filter(|s| !s.is_empty()) {
        let path = PathBuf::from(raw);
        if path.is_dir() {
            let mut files: Vec<PathBuf> = match std::fs::read_dir(&path) {
                Ok(entries) => entries
                    .filter_map(std::result::Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read layer directory, skipping");
                    continue;
                }
            };
            files.sort();
            found.extend(files.into_iter().filter_map(checked_external));
        } else if let Some(entry) = checked_external(path) {
            found.push(entry);
        }
    }
    found
}

fn checked_external(path: PathBuf) -> Option<LayerEntry> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "external layer does not exist, skipping");
        return None;
    }
    if !is_layer_file(&path) {
        tracing::warn!(path = %path.display(), "external file is not a layer, skipping");
        return None;
    }
    match LayerEntry::standalone(path) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(error = %e, "cannot stat external layer, skipping");
            None
        }
    }
}

pub(crate) fn ensure_absent(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        return Err(FimError::usage(format!(
            "File '{}' already exists",
            path.display()
        )));
    }
    Ok(())
}

fn copy_into_place(src: &Path, dst: &Path) -> Result<()> {
    let tmp = tmp_path(dst);
    let _ = std::fs::copy(src, &tmp).map_err(|e| FimError::io(&tmp, e))?;
    std::fs::rename(&tmp, dst).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        FimError::io(dst, e)
    })
}
