//! Layers embedded in the executable.
//!
//! Layers live after the end of the ELF image as a sequence of
//! `[u64 little-endian size][size bytes]` records. Appending copies the
//! binary to a sibling file, extends the copy and renames it over the
//! original, so running instances keep reading their open inode.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fim_common::error::{FimError, Result};

use crate::layer::GZIP_MAGIC;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELF64_HEADER_LEN: usize = 64;

/// A layer stored inside the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedLayer {
    /// Offset of the layer's first byte.
    pub offset: u64,
    /// Size of the layer in bytes.
    pub size: u64,
}

/// Byte offset where the ELF image of `binary` ends.
///
/// # Errors
///
/// Returns an error if `binary` cannot be read, is not a little-endian
/// ELF64 file, or declares a section header table ending past `u64::MAX`.
pub fn elf_end(binary: &Path) -> Result<u64> {
    let mut file = File::open(binary).map_err(|e| FimError::io(binary, e))?;
    let mut header = [0_u8; ELF64_HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|e| FimError::io(binary, e))?;
    if header[..4] != ELF_MAGIC || header[4] != ELFCLASS64 || header[5] != ELFDATA2LSB {
        return Err(FimError::Config {
            message: format!("'{}' is not a little-endian ELF64 binary", binary.display()),
        });
    }
    let shoff = u64::from_le_bytes(le_bytes(&header[0x28..0x30]));
    let shentsize = u16::from_le_bytes(le_bytes(&header[0x3a..0x3c]));
    let shnum = u16::from_le_bytes(le_bytes(&header[0x3c..0x3e]));
    u64::from(shentsize)
        .checked_mul(u64::from(shnum))
        .and_then(|table| shoff.checked_add(table))
        .ok_or_else(|| FimError::Config {
            message: format!(
                "ELF section header table of '{}' overflows",
                binary.display()
            ),
        })
}

fn le_bytes<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(slice);
    out
}

/// Lists the layers embedded in `binary`, in offset order.
///
/// Reading stops at end of file, or at the first record that is truncated
/// or is not a layer.
///
/// # Errors
///
/// Returns an error if `binary` cannot be read or is not ELF64.
pub fn read_embedded(binary: &Path) -> Result<Vec<EmbeddedLayer>> {
    let start = elf_end(binary)?;
    let mut file = File::open(binary).map_err(|e| FimError::io(binary, e))?;
    let len = file
        .metadata()
        .map_err(|e| FimError::io(binary, e))?
        .len();

    let mut layers = Vec::new();
    let mut pos = start;
    while pos + 8 <= len {
        let _ = file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| FimError::io(binary, e))?;
        let mut size = [0_u8; 8];
        file.read_exact(&mut size)
            .map_err(|e| FimError::io(binary, e))?;
        let size = u64::from_le_bytes(size);
        let offset = pos + 8;
        if size < 2 || offset.saturating_add(size) > len {
            tracing::warn!(binary = %binary.display(), offset, size, "truncated embedded layer record");
            break;
        }
        let mut magic = [0_u8; 2];
        file.read_exact(&mut magic)
            .map_err(|e| FimError::io(binary, e))?;
        if magic != GZIP_MAGIC {
            tracing::warn!(binary = %binary.display(), offset, "embedded record is not a layer");
            break;
        }
        layers.push(EmbeddedLayer { offset, size });
        pos = offset + size;
    }
    tracing::debug!(binary = %binary.display(), count = layers.len(), "embedded layers read");
    Ok(layers)
}

/// Appends the layer file `layer` to `binary`.
///
/// # Errors
///
/// Returns an error if either file cannot be read, or the updated binary
/// cannot be written or renamed into place.
pub fn append_embedded(binary: &Path, layer: &Path) -> Result<()> {
    let _ = elf_end(binary)?;
    let staged = sibling_tmp(binary);
    let result = stage_append(binary, layer, &staged);
    if result.is_err() {
        let _ = std::fs::remove_file(&staged);
    }
    result?;
    std::fs::rename(&staged, binary).map_err(|e| FimError::io(binary, e))?;
    tracing::info!(binary = %binary.display(), layer = %layer.display(), "layer appended to binary");
    Ok(())
}

fn stage_append(binary: &Path, layer: &Path, staged: &Path) -> Result<()> {
    let _ = std::fs::copy(binary, staged).map_err(|e| FimError::io(staged, e))?;
    let mut source = File::open(layer).map_err(|e| FimError::io(layer, e))?;
    let size = source
        .metadata()
        .map_err(|e| FimError::io(layer, e))?
        .len();
    let mut out = File::options()
        .append(true)
        .open(staged)
        .map_err(|e| FimError::io(staged, e))?;
    out.write_all(&size.to_le_bytes())
        .map_err(|e| FimError::io(staged, e))?;
    let copied = std::io::copy(&mut source, &mut out).map_err(|e| FimError::io(layer, e))?;
    if copied != size {
        return Err(FimError::Config {
            message: format!("'{}' changed while being appended", layer.display()),
        });
    }
    out.sync_all().map_err(|e| FimError::io(staged, e))
}

fn sibling_tmp(binary: &Path) -> PathBuf {
    let name = binary
        .file_name()
        .map_or_else(|| "binary".into(), |n| n.to_string_lossy());
    binary.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_of_test_binary(dir: &Path) -> PathBuf {
        let exe = std::env::current_exe().expect("current exe");
        let binary = dir.join("app");
        let _ = std::fs::copy(exe, &binary).expect("copy exe");
        binary
    }

    fn layer_with(dir: &Path, name: &str, content: &str) -> PathBuf {
        let src = dir.join(format!("{name}-src"));
        std::fs::create_dir_all(&src).expect("mkdir");
        std::fs::write(src.join(name), content).expect("write");
        let layer = dir.join(format!("{name}.layer"));
        let _ = crate::layer::create_layer(&src, &layer, 6).expect("create");
        layer
    }

    #[test]
    fn section_table_past_u64_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binary = dir.path().join("crafted");
        let mut header = [0_u8; ELF64_HEADER_LEN];
        header[..4].copy_from_slice(&ELF_MAGIC);
        header[4] = ELFCLASS64;
        header[5] = ELFDATA2LSB;
        header[0x28..0x30].copy_from_slice(&u64::MAX.to_le_bytes());
        header[0x3a..0x3c].copy_from_slice(&64_u16.to_le_bytes());
        header[0x3c..0x3e].copy_from_slice(&u16::MAX.to_le_bytes());
        std::fs::write(&binary, header).expect("write");

        let err = elf_end(&binary).unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert!(read_embedded(&binary).is_err());
    }

    #[test]
    fn fresh_binary_has_no_layers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binary = copy_of_test_binary(dir.path());
        assert!(read_embedded(&binary).expect("read").is_empty());
    }

    #[test]
    fn appended_layers_are_read_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binary = copy_of_test_binary(dir.path());
        let first = layer_with(dir.path(), "one", "1");
        let second = layer_with(dir.path(), "two", "2");

        append_embedded(&binary, &first).expect("append first");
        append_embedded(&binary, &second).expect("append second");

        let layers = read_embedded(&binary).expect("read");
        assert_eq!(layers.len(), 2);
        assert!(layers[0].offset < layers[1].offset);
        assert_eq!(
            layers[1].size,
            std::fs::metadata(&second).expect("stat").len()
        );

        let mut file = File::open(&binary).expect("open");
        let _ = file.seek(SeekFrom::Start(layers[1].offset)).expect("seek");
        let out = dir.path().join("out");
        crate::layer::extract_layer(file.take(layers[1].size), &out).expect("extract");
        assert_eq!(std::fs::read_to_string(out.join("two")).expect("read"), "2");
    }

    #[test]
    fn trailing_garbage_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let binary = copy_of_test_binary(dir.path());
        append_embedded(&binary, &layer_with(dir.path(), "one", "1")).expect("append");
        let mut file = File::options().append(true).open(&binary).expect("open");
        file.write_all(&[0xff; 5]).expect("write");
        assert_eq!(read_embedded(&binary).expect("read").len(), 1);
    }

    #[test]
    fn non_elf_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("script");
        std::fs::write(&script, "#!/bin/sh\n".repeat(10)).expect("write");
        assert!(elf_end(&script).is_err());
    }
}
