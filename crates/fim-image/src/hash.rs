//! SHA-256 cache keys for extracted layers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use fim_common::error::{FimError, Result};
use sha2::{Digest, Sha256};

/// Bytes sampled from each end of a layer.
const SAMPLE_LEN: u64 = 64 * 1024;

/// Key identifying the extracted contents of the layer at `offset` and
/// `size` inside `path`.
///
/// The key covers the layer's size and its leading and trailing bytes. The
/// tail holds the gzip trailer (CRC-32 and length of the whole tar stream),
/// so the key follows the content and not where it is stored: a layer keeps
/// its key when the binary around it is rewritten or when it moves between
/// a slot and the binary.
///
/// # Errors
///
/// Returns an error if `path` cannot be read or is shorter than
/// `offset + size`.
pub fn layer_key(path: &Path, offset: u64, size: u64) -> Result<String> {
    let mut file = File::open(path).map_err(|e| FimError::io(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());

    let head = size.min(SAMPLE_LEN);
    hash_range(&mut file, path, offset, head, &mut hasher)?;
    let rest = size - head;
    if rest > 0 {
        let tail = rest.min(SAMPLE_LEN);
        hash_range(&mut file, path, offset.saturating_add(size - tail), tail, &mut hasher)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_range(file: &mut File, path: &Path, start: u64, len: u64, hasher: &mut Sha256) -> Result<()> {
    let _ = file
        .seek(SeekFrom::Start(start))
        .map_err(|e| FimError::io(path, e))?;
    let copied = std::io::copy(&mut file.by_ref().take(len), hasher).map_err(|e| FimError::io(path, e))?;
    if copied != len {
        return Err(FimError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "layer extends past end of file"),
        ));
    }
    Ok(())
}

/// Key derived from an ordered list of other keys.
#[must_use]
pub fn combined_key<S: AsRef<str>>(keys: &[S]) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_ref().as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}
