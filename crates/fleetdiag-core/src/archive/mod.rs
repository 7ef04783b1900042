//! ZIP assembly helpers shared by the orchestrator and the bundle manager.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Append every entry of the archive at `path` to `writer`.
///
/// Entries are copied verbatim (no recompression).
///
/// # Errors
///
/// Returns [`ArchiveError`] when the source archive cannot be opened or an
/// entry cannot be copied.
pub fn append_archive<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    path: &Path,
) -> Result<(), ArchiveError> {
    let file = File::open(path).map_err(|err| ArchiveError::Open {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let mut archive = ZipArchive::new(file).map_err(|err| ArchiveError::Open {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(|err| ArchiveError::Copy {
            name: format!("#{index}"),
            reason: err.to_string(),
        })?;
        let name = entry.name().to_string();
        writer
            .raw_copy_file(entry)
            .map_err(|err| ArchiveError::Copy {
                name,
                reason: err.to_string(),
            })?;
    }

    Ok(())
}

/// Write one text entry into the archive.
///
/// # Errors
///
/// Returns [`ArchiveError::Copy`] when the entry cannot be created or
/// written.
pub fn write_entry<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    name: &str,
    data: &[u8],
) -> Result<(), ArchiveError> {
    writer
        .start_file(name, FileOptions::default())
        .and_then(|()| writer.write_all(data).map_err(zip::result::ZipError::Io))
        .map_err(|err| ArchiveError::Copy {
            name: name.to_string(),
            reason: err.to_string(),
        })
}

/// Line-oriented report accumulated during a collection run.
///
/// Becomes `summaryReport.txt` / `summaryErrorsReport.txt` inside the final
/// archive.
#[derive(Debug, Default)]
pub struct ReportBuffer {
    buf: String,
}

impl ReportBuffer {
    /// Empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one `"<prefix> [<detail>]"` line.
    pub fn add_line(&mut self, prefix: &str, detail: &str) {
        use std::fmt::Write as _;
        let _ = writeln!(self.buf, "{prefix} [{detail}]");
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Report content.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }
}

/// Archive assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// A source archive could not be opened.
    #[error("could not open {}: {reason}", path.display())]
    Open {
        /// Path of the archive.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// An entry could not be copied or written.
    #[error("could not copy file {name} to zip: {reason}")]
    Copy {
        /// Entry name.
        name: String,
        /// Human-readable cause.
        reason: String,
    },
}

/// Read one entry of the archive at `path` into a string. Test helper used
/// across the crate.
#[cfg(test)]
pub(crate) fn read_entry(path: &Path, name: &str) -> String {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut out = String::new();
    entry.read_to_string(&mut out).unwrap();
    out
}
