//! The bundle lifecycle manager.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use zip::write::FileOptions;
use zip::ZipWriter;

use super::{
    atomic_write_json, read_json, Bundle, BundleStatus, BundleType, StoreError, DATA_FILE,
    MAX_STATE_FILE_SIZE, STATE_FILE,
};
use crate::archive;
use crate::cancel::CancelToken;
use crate::collector::Collector;
use crate::io::CancelReader;

/// Bundle lifecycle errors, mapped onto HTTP statuses at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The id is not usable as a directory name.
    #[error("bundle id {id} is not valid")]
    InvalidId {
        /// Offending id.
        id: String,
    },

    /// No bundle directory with this id.
    #[error("bundle {id} not found")]
    NotFound {
        /// Requested id.
        id: String,
    },

    /// A bundle with this id already has a state.
    #[error("bundle {id} already exists")]
    AlreadyExists {
        /// Requested id.
        id: String,
    },

    /// The bundle working directory could not be created.
    #[error("could not create bundle {id} workdir: {reason}")]
    Workdir {
        /// Requested id.
        id: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The archive is not available yet.
    #[error("bundle {id} is not done yet (status {status}), try again later")]
    NotDone {
        /// Requested id.
        id: String,
        /// Current status.
        status: BundleStatus,
    },

    /// The archive is permanently unavailable.
    #[error("bundle {id} was {status}")]
    Gone {
        /// Requested id.
        id: String,
        /// Current status.
        status: BundleStatus,
    },

    /// The bundle's state could not be established; the carried record has
    /// the failure appended to its errors.
    #[error("{}", bundle.errors.last().map_or("bundle state error", String::as_str))]
    State {
        /// Synthesized record describing the failure.
        bundle: Box<Bundle>,
    },

    /// Some other filesystem failure.
    #[error("{message}")]
    Storage {
        /// Human-readable message.
        message: String,
    },
}

/// Why a bundle record could not be fully established.
enum LoadIssue {
    /// `state.json` unreadable or unparseable.
    State(String),
    /// `file.zip` missing for a `Done` bundle.
    Data(String),
}

struct Loaded {
    bundle: Bundle,
    issue: Option<LoadIssue>,
}

/// Filesystem-rooted lifecycle manager for diagnostics bundles.
///
/// Create and Delete are serialized per bundle id; reads tolerate in-flight
/// writers because state files are written atomically.
pub struct BundleManager {
    workdir: PathBuf,
    collector_timeout: Duration,
    bundle_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BundleManager {
    /// Create a manager rooted at `workdir`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] when the directory cannot be created,
    /// e.g. because the path names a file.
    pub fn new(
        workdir: impl Into<PathBuf>,
        collector_timeout: Duration,
        bundle_timeout: Duration,
    ) -> Result<Self, BundleError> {
        let workdir = workdir.into();
        std::fs::create_dir_all(&workdir).map_err(|err| BundleError::Storage {
            message: format!("could not create workdir {}: {err}", workdir.display()),
        })?;
        Ok(Self {
            workdir,
            collector_timeout,
            bundle_timeout,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory bundles live under.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Path of a bundle's archive.
    #[must_use]
    pub fn data_file_path(&self, id: &str) -> PathBuf {
        self.workdir.join(id).join(DATA_FILE)
    }

    fn state_file_path(&self, id: &str) -> PathBuf {
        self.workdir.join(id).join(STATE_FILE)
    }

    fn check_id(id: &str) -> Result<(), BundleError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains('/')
            && !id.contains('\\');
        if valid {
            Ok(())
        } else {
            Err(BundleError::InvalidId { id: id.to_string() })
        }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Establish a bundle record from disk without mutating anything.
    fn load(&self, id: &str) -> Loaded {
        let state_path = self.state_file_path(id);
        let mut bundle = match read_json::<Bundle>(&state_path, MAX_STATE_FILE_SIZE) {
            Ok(bundle) => bundle,
            Err(StoreError::Deserialize(err)) => {
                return Loaded {
                    bundle: Bundle::unknown(id),
                    issue: Some(LoadIssue::State(format!(
                        "could not unmarshal state file {id}: {err}"
                    ))),
                };
            }
            Err(err) => {
                return Loaded {
                    bundle: Bundle::unknown(id),
                    issue: Some(LoadIssue::State(format!(
                        "could not read state file for bundle {id}: {err}"
                    ))),
                };
            }
        };
        bundle.id = id.to_string();

        // A Done bundle must have its archive; report Unknown otherwise. The
        // downgrade is in-memory only, state.json is never rewritten here.
        if bundle.status == BundleStatus::Done {
            match std::fs::metadata(self.data_file_path(id)) {
                Ok(meta) => bundle.size = meta.len(),
                Err(err) => {
                    bundle.status = BundleStatus::Unknown;
                    return Loaded {
                        bundle,
                        issue: Some(LoadIssue::Data(format!(
                            "could not stat data file {id}: {err}"
                        ))),
                    };
                }
            }
        }

        Loaded {
            bundle,
            issue: None,
        }
    }

    /// All bundles under the working directory, sorted by id.
    ///
    /// Per-bundle problems are reflected in each record's status; only a
    /// failure to scan the directory itself is an error.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] when the working directory cannot be
    /// read.
    pub fn list(&self) -> Result<Vec<Bundle>, BundleError> {
        let entries = std::fs::read_dir(&self.workdir).map_err(|err| BundleError::Storage {
            message: format!("could not scan workdir {}: {err}", self.workdir.display()),
        })?;

        let mut bundles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| BundleError::Storage {
                message: format!("could not scan workdir {}: {err}", self.workdir.display()),
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if self.state_file_path(&id).exists() {
                bundles.push(self.load(&id).bundle);
            } else {
                // A directory without a state is a bundle of unknown origin.
                bundles.push(Bundle::unknown(id));
            }
        }
        bundles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bundles)
    }

    /// One bundle's record.
    ///
    /// # Errors
    ///
    /// [`BundleError::NotFound`] when no such directory exists;
    /// [`BundleError::State`] when the state cannot be established.
    pub fn get(&self, id: &str) -> Result<Bundle, BundleError> {
        Self::check_id(id)?;
        if !self.workdir.join(id).is_dir() {
            return Err(BundleError::NotFound { id: id.to_string() });
        }
        let Loaded { mut bundle, issue } = self.load(id);
        match issue {
            None => Ok(bundle),
            Some(LoadIssue::State(msg) | LoadIssue::Data(msg)) => {
                bundle.errors.push(msg);
                Err(BundleError::State {
                    bundle: Box::new(bundle),
                })
            }
        }
    }

    /// Path of the archive, available only once the bundle is `Done`.
    ///
    /// # Errors
    ///
    /// [`BundleError::NotDone`] while collection runs, [`BundleError::Gone`]
    /// for terminal-without-archive statuses, [`BundleError::Storage`] when
    /// the state cannot be read.
    pub fn get_file(&self, id: &str) -> Result<PathBuf, BundleError> {
        Self::check_id(id)?;
        let Loaded { bundle, issue } = self.load(id);
        if let Some(LoadIssue::State(message)) = issue {
            return Err(BundleError::Storage { message });
        }
        match bundle.status {
            BundleStatus::Done => Ok(self.data_file_path(id)),
            BundleStatus::Started | BundleStatus::InProgress => Err(BundleError::NotDone {
                id: id.to_string(),
                status: bundle.status,
            }),
            _ => Err(BundleError::Gone {
                id: id.to_string(),
                status: bundle.status,
            }),
        }
    }

    /// Create a bundle and launch its collection in the background.
    ///
    /// # Errors
    ///
    /// [`BundleError::AlreadyExists`] when the id already has a state (the
    /// filesystem is left untouched), [`BundleError::Workdir`] when the
    /// bundle directory cannot be created.
    pub fn create(
        self: &Arc<Self>,
        id: &str,
        kind: BundleType,
        collectors: Vec<Arc<dyn Collector>>,
    ) -> Result<Bundle, BundleError> {
        Self::check_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.state_file_path(id).exists() {
            return Err(BundleError::AlreadyExists { id: id.to_string() });
        }
        std::fs::create_dir_all(self.workdir.join(id)).map_err(|err| BundleError::Workdir {
            id: id.to_string(),
            reason: err.to_string(),
        })?;

        let bundle = Bundle {
            id: id.to_string(),
            kind,
            status: BundleStatus::Started,
            started_at: Some(Utc::now()),
            stopped_at: None,
            size: 0,
            errors: Vec::new(),
        };
        atomic_write_json(&self.state_file_path(id), &bundle).map_err(|err| {
            BundleError::Storage {
                message: format!("could not write state file for bundle {id}: {err}"),
            }
        })?;

        info!(id, collectors = collectors.len(), "bundle created, starting collection");
        let manager = Arc::clone(self);
        let task = bundle.clone();
        std::thread::Builder::new()
            .name(format!("bundle-{id}"))
            .spawn(move || manager.run_collection(task, collectors))
            .map_err(|err| BundleError::Storage {
                message: format!("could not start collection for bundle {id}: {err}"),
            })?;

        Ok(bundle)
    }

    /// Drive the collectors into `file.zip` and persist the final state.
    fn run_collection(&self, mut bundle: Bundle, collectors: Vec<Arc<dyn Collector>>) {
        let token = CancelToken::with_timeout(self.bundle_timeout);
        let id = bundle.id.clone();

        {
            let lock = self.lock_for(&id);
            let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if self.load(&id).bundle.status == BundleStatus::Deleted {
                info!(%id, "bundle deleted before collection started");
                return;
            }
            bundle.status = BundleStatus::InProgress;
            if let Err(err) = atomic_write_json(&self.state_file_path(&id), &bundle) {
                warn!(%id, %err, "could not persist InProgress state");
            }
        }

        let data_path = self.data_file_path(&id);
        let file = match File::create(&data_path) {
            Ok(file) => file,
            Err(err) => {
                bundle.status = BundleStatus::Failed;
                bundle
                    .errors
                    .push(format!("could not create data file {id}: {err}"));
                bundle.stopped_at = Some(Utc::now());
                self.finalize(&bundle);
                return;
            }
        };
        let mut zip = ZipWriter::new(file);

        for collector in collectors {
            let child = token.child_with_timeout(self.collector_timeout);
            match collector.collect(&child) {
                Err(err) if collector.optional() => {
                    // Optional collectors still get an entry: the error text.
                    if let Err(write_err) =
                        archive::write_entry(&mut zip, collector.name(), err.to_string().as_bytes())
                    {
                        bundle.errors.push(write_err.to_string());
                    }
                }
                Err(err) => {
                    bundle
                        .errors
                        .push(format!("could not collect {}: {err}", collector.name()));
                }
                Ok(reader) => {
                    if let Err(err) = zip.start_file(collector.name(), FileOptions::default()) {
                        bundle.errors.push(format!(
                            "could not create file {} in zip: {err}",
                            collector.name()
                        ));
                        continue;
                    }
                    let mut reader = CancelReader::new(child, reader);
                    if let Err(err) = std::io::copy(&mut reader, &mut zip) {
                        // The partial entry stays; the failure is recorded.
                        bundle.errors.push(format!(
                            "could not copy {} data to zip: {err}",
                            collector.name()
                        ));
                    }
                }
            }
        }

        if !bundle.errors.is_empty() {
            let report = bundle.errors.join("\n");
            if let Err(err) =
                archive::write_entry(&mut zip, "summaryErrorsReport.txt", report.as_bytes())
            {
                error!(%id, %err, "could not append the errors report");
            }
        }

        if let Err(err) = zip.finish() {
            bundle
                .errors
                .push(format!("could not finalize data file {id}: {err}"));
        }

        bundle.size = std::fs::metadata(&data_path).map_or(0, |meta| meta.len());
        bundle.status = BundleStatus::Done;
        bundle.stopped_at = Some(Utc::now());
        self.finalize(&bundle);
        debug!(%id, size = bundle.size, errors = bundle.errors.len(), "collection finished");
    }

    /// Persist the terminal state unless the bundle was deleted mid-flight;
    /// a Deleted bundle never becomes Done again.
    fn finalize(&self, bundle: &Bundle) {
        let lock = self.lock_for(&bundle.id);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let current = self.load(&bundle.id).bundle;
        if current.status == BundleStatus::Deleted {
            let _ = std::fs::remove_file(self.data_file_path(&bundle.id));
            info!(id = %bundle.id, "bundle deleted during collection, keeping Deleted state");
            return;
        }
        if let Err(err) = atomic_write_json(&self.state_file_path(&bundle.id), bundle) {
            error!(id = %bundle.id, %err, "could not persist final bundle state");
        }
    }

    /// Remove a bundle's archive, retaining its metadata.
    ///
    /// Deleting an already-deleted bundle is a no-op that returns the state.
    ///
    /// # Errors
    ///
    /// [`BundleError::NotFound`] for unknown ids, [`BundleError::State`] when
    /// the state or the archive cannot be established.
    pub fn delete(&self, id: &str) -> Result<Bundle, BundleError> {
        Self::check_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if !self.workdir.join(id).is_dir() {
            return Err(BundleError::NotFound { id: id.to_string() });
        }

        let Loaded { mut bundle, issue } = self.load(id);
        if let Some(LoadIssue::State(msg) | LoadIssue::Data(msg)) = issue {
            bundle.errors.push(msg);
            return Err(BundleError::State {
                bundle: Box::new(bundle),
            });
        }
        if bundle.status == BundleStatus::Deleted {
            return Ok(bundle);
        }

        let data_path = self.data_file_path(id);
        let size = match std::fs::metadata(&data_path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                bundle
                    .errors
                    .push(format!("could not stat data file {id}: {err}"));
                return Err(BundleError::State {
                    bundle: Box::new(bundle),
                });
            }
        };
        std::fs::remove_file(&data_path).map_err(|err| BundleError::Storage {
            message: format!("could not remove data file {id}: {err}"),
        })?;

        bundle.status = BundleStatus::Deleted;
        bundle.stopped_at = Some(Utc::now());
        bundle.size = size;
        atomic_write_json(&self.state_file_path(id), &bundle).map_err(|err| {
            BundleError::Storage {
                message: format!("could not write state file for bundle {id}: {err}"),
            }
        })?;

        info!(id, size, "bundle archive deleted");
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Instant;

    use super::*;
    use crate::collector::CollectorError;

    const COLLECTOR_TIMEOUT: Duration = Duration::from_millis(5);

    fn manager(dir: &Path) -> Arc<BundleManager> {
        Arc::new(
            BundleManager::new(dir.join("bundles"), COLLECTOR_TIMEOUT, Duration::from_secs(5))
                .unwrap(),
        )
    }

    fn write_state(workdir: &Path, id: &str, body: &str) {
        let dir = workdir.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(STATE_FILE), body).unwrap();
    }

    fn wait_for_done(manager: &BundleManager, id: &str) -> Bundle {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let bundle = manager.get(id).unwrap();
            if bundle.status == BundleStatus::Done {
                return bundle;
            }
            assert!(Instant::now() < deadline, "bundle {id} never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    struct MockCollector {
        name: &'static str,
        optional: bool,
        body: Option<&'static str>,
        error: Option<&'static str>,
        slow: bool,
    }

    impl MockCollector {
        fn ok(name: &'static str, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                optional: false,
                body: Some(body),
                error: None,
                slow: false,
            })
        }

        fn failing(name: &'static str, error: &'static str, optional: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                optional,
                body: None,
                error: Some(error),
                slow: false,
            })
        }

        fn slow(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                optional: false,
                body: None,
                error: None,
                slow: true,
            })
        }
    }

    /// Produces no data and no EOF; `io::copy` keeps retrying until the
    /// collector deadline fires.
    struct SlowReader;

    impl Read for SlowReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            Err(std::io::Error::from(std::io::ErrorKind::Interrupted))
        }
    }

    impl Collector for MockCollector {
        fn name(&self) -> &str {
            self.name
        }

        fn optional(&self) -> bool {
            self.optional
        }

        fn collect(&self, _token: &CancelToken) -> Result<Box<dyn Read + Send>, CollectorError> {
            if let Some(error) = self.error {
                return Err(CollectorError::Failed(error.to_string()));
            }
            if self.slow {
                return Ok(Box::new(SlowReader));
            }
            Ok(Box::new(std::io::Cursor::new(
                self.body.unwrap_or_default().as_bytes().to_vec(),
            )))
        }
    }

    #[test]
    fn test_list_is_empty_for_fresh_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_ignores_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        std::fs::write(manager.workdir().join("not-a-bundle.txt"), b"x").unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn test_dirs_without_state_list_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        for i in 0..3 {
            std::fs::create_dir(manager.workdir().join(format!("bundle-{i}"))).unwrap();
        }

        let bundles = manager.list().unwrap();
        assert_eq!(bundles.len(), 3);
        for (i, bundle) in bundles.iter().enumerate() {
            assert_eq!(bundle.id, format!("bundle-{i}"));
            assert_eq!(bundle.status, BundleStatus::Unknown);
            assert!(bundle.errors.is_empty());
        }
    }

    #[test]
    fn test_done_without_archive_lists_as_unknown_without_rewriting_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let state = r#"{
            "id": "bundle",
            "status": "Done",
            "started_at": "1991-05-21T00:00:00Z",
            "stopped_at": "2019-05-21T00:00:00Z"
        }"#;
        write_state(manager.workdir(), "bundle", state);

        let bundles = manager.list().unwrap();
        assert_eq!(bundles[0].status, BundleStatus::Unknown);

        // state.json is untouched.
        let raw = std::fs::read_to_string(manager.state_file_path("bundle")).unwrap();
        assert_eq!(raw, state);
    }

    #[test]
    fn test_done_with_archive_refreshes_size_in_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let state = r#"{"id": "bundle", "type": "Local", "status": "Done",
            "started_at": "1991-05-21T00:00:00Z", "stopped_at": "2019-05-21T00:00:00Z"}"#;
        write_state(manager.workdir(), "bundle", state);
        std::fs::write(manager.data_file_path("bundle"), b"OK").unwrap();

        let bundle = manager.get("bundle").unwrap();
        assert_eq!(bundle.status, BundleStatus::Done);
        assert_eq!(bundle.size, 2);

        let raw = std::fs::read_to_string(manager.state_file_path("bundle")).unwrap();
        assert_eq!(raw, state);
    }

    #[test]
    fn test_get_reports_malformed_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        write_state(manager.workdir(), "bundle", "invalid JSON");

        let err = manager.get("bundle").unwrap_err();
        let BundleError::State { bundle } = err else {
            panic!("expected a state error");
        };
        assert_eq!(bundle.status, BundleStatus::Unknown);
        assert!(bundle.errors[0].starts_with("could not unmarshal state file bundle:"));
    }

    #[test]
    fn test_get_file_gates_on_status() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        write_state(
            manager.workdir(),
            "started",
            r#"{"id": "started", "status": "Started"}"#,
        );
        assert!(matches!(
            manager.get_file("started"),
            Err(BundleError::NotDone {
                status: BundleStatus::Started,
                ..
            })
        ));

        write_state(
            manager.workdir(),
            "deleted",
            r#"{"id": "deleted", "status": "Deleted"}"#,
        );
        assert!(matches!(
            manager.get_file("deleted"),
            Err(BundleError::Gone {
                status: BundleStatus::Deleted,
                ..
            })
        ));

        let err = manager.get_file("missing").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("could not read state file for bundle missing:"));

        write_state(manager.workdir(), "done", r#"{"id": "done", "status": "Done"}"#);
        std::fs::write(manager.data_file_path("done"), b"OK").unwrap();
        assert_eq!(manager.get_file("done").unwrap(), manager.data_file_path("done"));
    }

    #[test]
    fn test_create_rejects_existing_bundle_without_touching_it() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let state = r#"{"id": "bundle-0", "status": "Done", "size": 2,
            "started_at": "1991-05-21T00:00:00Z", "stopped_at": "2019-05-21T00:00:00Z"}"#;
        write_state(manager.workdir(), "bundle-0", state);
        std::fs::write(manager.data_file_path("bundle-0"), b"OK").unwrap();

        let err = manager.create("bundle-0", BundleType::Local, Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "bundle bundle-0 already exists");

        let raw = std::fs::read_to_string(manager.state_file_path("bundle-0")).unwrap();
        assert_eq!(raw, state);
    }

    #[test]
    fn test_create_reports_workdir_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        // A file squatting on the bundle directory path.
        std::fs::write(manager.workdir().join("bundle-0"), b"").unwrap();

        let err = manager.create("bundle-0", BundleType::Local, Vec::new()).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("could not create bundle bundle-0 workdir:"));
    }

    #[test]
    fn test_create_rejects_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(matches!(
            manager.create("../escape", BundleType::Local, Vec::new()),
            Err(BundleError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_collection_with_mixed_collectors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let collectors: Vec<Arc<dyn Collector>> = vec![
            MockCollector::failing("c1", "some error", false),
            MockCollector::ok("c2", "OK"),
            MockCollector::failing("c3", "some other error", true),
            MockCollector::slow("c4"),
        ];

        let created = manager.create("bundle-0", BundleType::Local, collectors).unwrap();
        assert_eq!(created.status, BundleStatus::Started);
        assert!(created.started_at.is_some());

        let done = wait_for_done(&manager, "bundle-0");
        assert_eq!(
            done.errors,
            vec![
                "could not collect c1: some error".to_string(),
                "could not copy c4 data to zip: context deadline exceeded".to_string(),
            ]
        );
        assert!(done.stopped_at.is_some());
        assert!(done.size > 0);

        let data = manager.get_file("bundle-0").unwrap();
        let mut archive = zip::ZipArchive::new(File::open(&data).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["c2", "c3", "c4", "summaryErrorsReport.txt"]);

        assert_eq!(crate::archive::read_entry(&data, "c2"), "OK");
        assert_eq!(crate::archive::read_entry(&data, "c3"), "some other error");
        assert_eq!(crate::archive::read_entry(&data, "c4"), "");
        assert_eq!(
            crate::archive::read_entry(&data, "summaryErrorsReport.txt"),
            "could not collect c1: some error\ncould not copy c4 data to zip: context deadline exceeded"
        );

        // Delete keeps the metadata, records the size, removes the archive.
        let deleted = manager.delete("bundle-0").unwrap();
        assert_eq!(deleted.status, BundleStatus::Deleted);
        assert_eq!(deleted.size, done.size);
        assert!(!manager.data_file_path("bundle-0").exists());
        assert!(manager.state_file_path("bundle-0").exists());

        // Deleting again is a no-op returning the state.
        let again = manager.delete("bundle-0").unwrap();
        assert_eq!(again.status, BundleStatus::Deleted);
        assert_eq!(again.size, done.size);
    }

    #[test]
    fn test_delete_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(matches!(
            manager.delete("nope"),
            Err(BundleError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_without_archive_reports_stat_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        write_state(
            manager.workdir(),
            "missing-data-file",
            r#"{"id": "bundle", "status": "Done",
                "started_at": "1991-05-21T00:00:00Z", "stopped_at": "2019-05-21T00:00:00Z"}"#,
        );

        let err = manager.delete("missing-data-file").unwrap_err();
        let BundleError::State { bundle } = err else {
            panic!("expected a state error");
        };
        assert_eq!(bundle.status, BundleStatus::Unknown);
        assert!(bundle.errors[0].starts_with("could not stat data file missing-data-file:"));
    }

    #[test]
    fn test_delete_during_collection_is_not_resurrected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        // A collector slow enough for delete to land mid-collection.
        let collectors: Vec<Arc<dyn Collector>> = vec![MockCollector::slow("slow")];
        manager.create("bundle-0", BundleType::Local, collectors).unwrap();

        // Wait for the archive to appear, then delete while collecting.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !manager.data_file_path("bundle-0").exists() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        let deleted = manager.delete("bundle-0");

        // Whatever the interleaving, a Deleted bundle stays Deleted.
        if deleted.is_ok() {
            let settle = Instant::now() + Duration::from_secs(10);
            loop {
                let bundle = manager.get("bundle-0").unwrap();
                assert_ne!(bundle.status, BundleStatus::Done);
                if bundle.status == BundleStatus::Deleted
                    && !manager.data_file_path("bundle-0").exists()
                {
                    break;
                }
                assert!(Instant::now() < settle);
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}
