//! Crash-safe state-file IO.
//!
//! `state.json` is written with the temp-file + flush + rename protocol: a
//! reader observes either the old complete record or the new complete record,
//! never a partial write. Reads are size-bounded before deserialization so a
//! corrupted state file cannot exhaust memory.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum accepted size of a state file.
pub const MAX_STATE_FILE_SIZE: u64 = 1024 * 1024;

/// State-file IO errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The file exceeds [`MAX_STATE_FILE_SIZE`].
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Allowed maximum in bytes.
        max: u64,
    },

    /// The record could not be serialized.
    #[error("json serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The file is not a valid record.
    #[error("{0}")]
    Deserialize(#[source] serde_json::Error),

    /// An IO error during read or write.
    #[error("{0}")]
    Io(#[source] std::io::Error),
}

/// Serialize `value` and write it to `path` atomically.
///
/// The temp file is created in the parent directory of `path` so the final
/// rename never crosses filesystems.
///
/// # Errors
///
/// Returns [`StoreError`] when serialization or any filesystem step fails.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        ))
    })?;

    let data = serde_json::to_vec(value).map_err(StoreError::Serialize)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(StoreError::Io)?;
    temp.write_all(&data).map_err(StoreError::Io)?;
    temp.flush().map_err(StoreError::Io)?;
    temp.as_file().sync_all().map_err(StoreError::Io)?;
    temp.persist(path)
        .map_err(|err| StoreError::Io(err.error))?;

    Ok(())
}

/// Read and deserialize a record from `path`, bounded by `max_size`.
///
/// # Errors
///
/// [`StoreError::Io`] when the file cannot be read, [`StoreError::FileTooLarge`]
/// when it exceeds the bound, [`StoreError::Deserialize`] when it is not a
/// valid record.
pub fn read_json<T: DeserializeOwned>(path: &Path, max_size: u64) -> Result<T, StoreError> {
    let mut file = File::open(path).map_err(StoreError::Io)?;
    let size = file.metadata().map_err(StoreError::Io)?.len();
    if size > max_size {
        return Err(StoreError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    let mut raw = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    file.read_to_end(&mut raw).map_err(StoreError::Io)?;
    serde_json::from_slice(&raw).map_err(StoreError::Deserialize)
}
