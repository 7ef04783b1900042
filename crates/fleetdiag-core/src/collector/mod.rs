//! Collectors: named sources of one archive entry each.
//!
//! A lifecycle bundle is produced by draining a list of collectors into a
//! ZIP. Collectors stream — the bundle manager wraps every returned reader in
//! a cancel-aware adapter so a stuck producer cannot outlive the job.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cancel::{CancelError, CancelToken};
use crate::catalog::{CommandEndpoint, FileEndpoint};

/// A named source of one archive entry.
pub trait Collector: Send + Sync {
    /// Entry name inside the bundle archive.
    fn name(&self) -> &str;

    /// Whether a collection failure is tolerated.
    fn optional(&self) -> bool;

    /// Produce the entry body as a streaming reader.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] when the artifact cannot be produced at
    /// all; partial output is delivered through the reader instead.
    fn collect(&self, token: &CancelToken) -> Result<Box<dyn Read + Send>, CollectorError>;
}

/// Collector failures.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The artifact could not be produced.
    #[error("{0}")]
    Failed(String),

    /// The job was canceled before the collector ran.
    #[error(transparent)]
    Canceled(#[from] CancelError),
}

/// Capability that reads service-manager unit journals.
///
/// The platform-specific reader lives outside the core; tests and non-Linux
/// builds substitute their own.
pub trait JournalReader: Send + Sync {
    /// Journal output of `unit` covering the last `since`.
    ///
    /// # Errors
    ///
    /// Returns an [`std::io::Error`] when the journal cannot be opened.
    fn read_since(&self, unit: &str, since: Duration)
        -> std::io::Result<Box<dyn Read + Send>>;
}

/// Collector streaming a local file.
#[derive(Debug, Clone)]
pub struct FileCollector {
    name: String,
    location: PathBuf,
    optional: bool,
}

impl FileCollector {
    /// Collector for a configured file endpoint, named by its catalog key.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: &FileEndpoint) -> Self {
        Self {
            name: name.into(),
            location: endpoint.location.clone(),
            optional: endpoint.optional,
        }
    }
}

impl Collector for FileCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn optional(&self) -> bool {
        self.optional
    }

    fn collect(&self, token: &CancelToken) -> Result<Box<dyn Read + Send>, CollectorError> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }
        debug!(name = %self.name, location = %self.location.display(), "collecting file");
        match std::fs::File::open(&self.location) {
            Ok(file) => Ok(Box::new(file)),
            // An optional file that cannot be read still yields an entry:
            // its body is the error text.
            Err(err) if self.optional => Ok(Box::new(Cursor::new(err.to_string()))),
            Err(err) => Err(CollectorError::Failed(err.to_string())),
        }
    }
}

/// Collector capturing the output of a local command.
#[derive(Debug, Clone)]
pub struct CommandCollector {
    name: String,
    command: Vec<String>,
    optional: bool,
}

impl CommandCollector {
    /// Collector for a configured command endpoint, named by its catalog key.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint: &CommandEndpoint) -> Self {
        Self {
            name: name.into(),
            command: endpoint.command.clone(),
            optional: endpoint.optional,
        }
    }
}

impl Collector for CommandCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn optional(&self) -> bool {
        self.optional
    }

    fn collect(&self, token: &CancelToken) -> Result<Box<dyn Read + Send>, CollectorError> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }
        debug!(name = %self.name, command = ?self.command, "collecting command output");
        let spawned = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match spawned {
            Ok(child) => Ok(Box::new(ChildOutputReader::new(child))),
            Err(err) if self.optional => Ok(Box::new(Cursor::new(err.to_string()))),
            Err(err) => Err(CollectorError::Failed(err.to_string())),
        }
    }
}

/// Streams a child's stdout, then its stderr, then reaps it.
///
/// Dropping the reader kills a still-running child, so a deadline hit during
/// the archive copy does not leak processes.
pub struct ChildOutputReader {
    child: Child,
    reading_stderr: bool,
    reaped: bool,
}

impl ChildOutputReader {
    /// Take ownership of a spawned child whose output streams are piped.
    #[must_use]
    pub fn new(child: Child) -> Self {
        Self {
            child,
            reading_stderr: false,
            reaped: false,
        }
    }
}

impl Read for ChildOutputReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.reading_stderr {
            if let Some(stdout) = self.child.stdout.as_mut() {
                let n = stdout.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.reading_stderr = true;
        }
        if let Some(stderr) = self.child.stderr.as_mut() {
            let n = stderr.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
        }
        if !self.reaped {
            self.reaped = true;
            let _ = self.child.wait();
        }
        Ok(0)
    }
}

impl Drop for ChildOutputReader {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Collector reading a unit journal through the [`JournalReader`] capability.
pub struct JournalCollector {
    name: String,
    unit: String,
    since: Duration,
    optional: bool,
    reader: Arc<dyn JournalReader>,
}

impl JournalCollector {
    /// Collector for `unit`, named by its catalog key.
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        since: Duration,
        optional: bool,
        reader: Arc<dyn JournalReader>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            since,
            optional,
            reader,
        }
    }
}

impl Collector for JournalCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn optional(&self) -> bool {
        self.optional
    }

    fn collect(&self, token: &CancelToken) -> Result<Box<dyn Read + Send>, CollectorError> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }
        debug!(name = %self.name, unit = %self.unit, "collecting unit journal");
        match self.reader.read_since(&self.unit, self.since) {
            Ok(reader) => Ok(reader),
            Err(err) if self.optional => Ok(Box::new(Cursor::new(err.to_string()))),
            Err(err) => Err(CollectorError::Failed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::catalog::FileEndpoint;

    fn endpoint(location: &std::path::Path, optional: bool) -> FileEndpoint {
        FileEndpoint {
            location: location.to_path_buf(),
            roles: Vec::new(),
            optional,
        }
    }

    #[test]
    fn test_file_collector_streams_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "log line").unwrap();

        let collector = FileCollector::new("var_log_x.log", &endpoint(file.path(), false));
        let mut body = String::new();
        collector
            .collect(&CancelToken::new())
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "log line");
    }

    #[test]
    fn test_missing_file_fails_unless_optional() {
        let missing = std::path::Path::new("/no/such/file");

        let required = FileCollector::new("x", &endpoint(missing, false));
        assert!(matches!(
            required.collect(&CancelToken::new()),
            Err(CollectorError::Failed(_))
        ));

        // Optional: the error text becomes the entry body.
        let optional = FileCollector::new("x", &endpoint(missing, true));
        let mut body = String::new();
        optional
            .collect(&CancelToken::new())
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert!(!body.is_empty());
    }

    #[test]
    fn test_command_collector_captures_stdout() {
        let collector = CommandCollector::new(
            "echo.output",
            &CommandEndpoint {
                command: vec!["echo".to_string(), "-n".to_string(), "hello".to_string()],
                roles: Vec::new(),
                optional: false,
            },
        );
        let mut body = String::new();
        collector
            .collect(&CancelToken::new())
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "hello");
    }

    #[test]
    fn test_command_collector_missing_binary() {
        let base = CommandEndpoint {
            command: vec!["/no/such/binary".to_string()],
            roles: Vec::new(),
            optional: false,
        };

        let required = CommandCollector::new("x.output", &base);
        assert!(required.collect(&CancelToken::new()).is_err());

        let optional = CommandCollector::new(
            "x.output",
            &CommandEndpoint {
                optional: true,
                ..base
            },
        );
        let mut body = String::new();
        optional
            .collect(&CancelToken::new())
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert!(!body.is_empty());
    }

    #[test]
    fn test_canceled_token_rejects_collection() {
        let token = CancelToken::new();
        token.cancel();
        let collector = CommandCollector::new(
            "echo.output",
            &CommandEndpoint {
                command: vec!["echo".to_string()],
                roles: Vec::new(),
                optional: false,
            },
        );
        assert!(matches!(
            collector.collect(&token),
            Err(CollectorError::Canceled(_))
        ));
    }
}
