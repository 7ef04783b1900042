//! Fetcher workers.
//!
//! A fetcher pulls endpoint artifacts over HTTP and streams them, gzipped,
//! into its own temporary ZIP. Workers share one request channel, one status
//! channel and one response channel; the orchestrator pre-fills the request
//! channel, closes it, and then consumes exactly one status update per
//! request and exactly one bulk response per worker.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use prometheus::HistogramVec;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::cancel::{CancelError, CancelToken};
use crate::node::Node;

/// Bytes of an error response body kept in a status update.
const MAX_ERROR_BODY: usize = 512;

/// Streaming copy buffer size.
const COPY_BUF: usize = 32 * 1024;

/// One artifact to fetch from one node.
#[derive(Debug, Clone)]
pub struct EndpointRequest {
    /// Full URL to GET.
    pub url: String,

    /// Node the artifact comes from.
    pub node: Node,

    /// Path of the entry inside the final archive.
    pub file_name: String,

    /// Whether a failure may fail the bundle.
    pub optional: bool,
}

/// Outcome of one attempted request.
#[derive(Debug)]
pub struct StatusUpdate {
    /// URL that was attempted.
    pub url: String,

    /// Fetch failure, when the attempt did not produce an archive entry.
    pub error: Option<FetchError>,
}

/// Final message of a worker: where its temporary ZIP landed.
#[derive(Debug)]
pub struct BulkResponse {
    /// Path of the worker's temporary ZIP.
    pub zip_path: PathBuf,

    /// Error finalizing the archive, if any.
    pub error: Option<FetchError>,
}

/// Fetch pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The worker's temporary archive could not be created.
    #[error("could not create temp zip file in {}: {reason}", dir.display())]
    CannotCreateArchive {
        /// Directory the archive was to be created in.
        dir: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// Transport-level failure talking to the endpoint.
    #[error("could not fetch {url}: {reason}")]
    Transport {
        /// URL that failed.
        url: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The endpoint answered outside the 2xx range.
    #[error("Return code {code}. Body: {body}")]
    BadStatus {
        /// HTTP status code.
        code: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The artifact could not be written into the archive.
    #[error("could not write {name} to archive: {reason}")]
    Archive {
        /// Entry name.
        name: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The archive could not be finalized.
    #[error("could not finalize archive {}: {reason}", path.display())]
    Finalize {
        /// Archive path.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// The job was canceled or timed out mid-request.
    #[error(transparent)]
    Canceled(#[from] CancelError),

    /// A worker thread could not be spawned.
    #[error("could not spawn fetcher worker: {0}")]
    Spawn(String),
}

/// One fetcher worker. Owns a temporary ZIP under the job's workdir.
pub struct Fetcher {
    zip_path: PathBuf,
    zip: ZipWriter<File>,
    client: reqwest::blocking::Client,
    requests: Receiver<EndpointRequest>,
    status: Sender<StatusUpdate>,
    responses: Sender<BulkResponse>,
    histogram: HistogramVec,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("zip_path", &self.zip_path)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a worker with its temporary archive in `workdir`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::CannotCreateArchive`] when the archive cannot be
    /// created, e.g. because `workdir` does not exist.
    pub fn new(
        workdir: &Path,
        client: reqwest::blocking::Client,
        requests: Receiver<EndpointRequest>,
        status: Sender<StatusUpdate>,
        responses: Sender<BulkResponse>,
        histogram: HistogramVec,
    ) -> Result<Self, FetchError> {
        let (file, zip_path) = tempfile::Builder::new()
            .prefix("fetcher-")
            .suffix(".zip")
            .tempfile_in(workdir)
            .and_then(|f| f.keep().map_err(Into::into))
            .map_err(|err| FetchError::CannotCreateArchive {
                dir: workdir.to_path_buf(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            zip_path,
            zip: ZipWriter::new(file),
            client,
            requests,
            status,
            responses,
            histogram,
        })
    }

    /// Consume requests until the channel closes or the token fires, then
    /// finalize the archive and emit exactly one [`BulkResponse`].
    pub fn run(mut self, token: &CancelToken) {
        loop {
            crossbeam_channel::select! {
                recv(self.requests) -> msg => match msg {
                    Ok(request) => self.process(request, token),
                    Err(_) => break,
                },
                recv(token.done()) -> _ => break,
                default(token.time_left()) => break,
            }
        }

        let error = self.zip.finish().err().map(|err| FetchError::Finalize {
            path: self.zip_path.clone(),
            reason: err.to_string(),
        });
        let _ = self.responses.send(BulkResponse {
            zip_path: self.zip_path,
            error,
        });
    }

    fn process(&mut self, request: EndpointRequest, token: &CancelToken) {
        let error = self.fetch(&request, token).err();
        if let Some(err) = &error {
            debug!(url = %request.url, %err, "endpoint fetch failed");
        }
        self.send_status(
            StatusUpdate {
                url: request.url,
                error,
            },
            token,
        );
    }

    /// Send a status update unless the token fires first; the orchestrator
    /// stops reading once its own deadline passes.
    fn send_status(&self, update: StatusUpdate, token: &CancelToken) {
        crossbeam_channel::select! {
            send(self.status, update) -> _ => {},
            recv(token.done()) -> _ => {},
            default(token.time_left()) => {},
        }
    }

    fn fetch(&mut self, request: &EndpointRequest, token: &CancelToken) -> Result<(), FetchError> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }

        let started = Instant::now();
        let mut response =
            self.client
                .get(&request.url)
                .send()
                .map_err(|err| FetchError::Transport {
                    url: request.url.clone(),
                    reason: err.to_string(),
                })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let mut body = response.text().unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            return Err(FetchError::BadStatus { code: status, body });
        }

        self.zip
            .start_file(
                request.file_name.as_str(),
                FileOptions::default().compression_method(CompressionMethod::Stored),
            )
            .map_err(|err| FetchError::Archive {
                name: request.file_name.clone(),
                reason: err.to_string(),
            })?;

        let mut encoder = GzEncoder::new(&mut self.zip, Compression::default());
        let mut buf = [0u8; COPY_BUF];
        loop {
            if let Some(reason) = token.err() {
                // Close the entry with whatever arrived so far; partial data
                // stays recoverable.
                let _ = encoder.try_finish();
                return Err(reason.into());
            }
            let n = response.read(&mut buf).map_err(|err| FetchError::Transport {
                url: request.url.clone(),
                reason: err.to_string(),
            })?;
            if n == 0 {
                break;
            }
            encoder
                .write_all(&buf[..n])
                .map_err(|err| FetchError::Archive {
                    name: request.file_name.clone(),
                    reason: err.to_string(),
                })?;
        }
        encoder.try_finish().map_err(|err| FetchError::Archive {
            name: request.file_name.clone(),
            reason: err.to_string(),
        })?;
        drop(encoder);

        self.histogram
            .with_label_values(&[url_path(&request.url).as_str(), &status.to_string()])
            .observe(started.elapsed().as_secs_f64());

        Ok(())
    }
}

/// Path component of a URL, for metric labels.
fn url_path(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// A fixed-size group of fetcher workers.
pub struct FetcherPool {
    handles: Vec<JoinHandle<()>>,
}

impl FetcherPool {
    /// Construct `count` workers (at least one) and start them.
    ///
    /// All workers are constructed before any thread starts, so a missing
    /// workdir fails the whole pool up front.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when a worker archive cannot be created or a
    /// thread cannot be spawned.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        count: usize,
        workdir: &Path,
        client: &reqwest::blocking::Client,
        requests: &Receiver<EndpointRequest>,
        status: &Sender<StatusUpdate>,
        responses: &Sender<BulkResponse>,
        histogram: &HistogramVec,
        token: &CancelToken,
    ) -> Result<Self, FetchError> {
        let count = count.max(1);
        let mut fetchers = Vec::with_capacity(count);
        for _ in 0..count {
            fetchers.push(Fetcher::new(
                workdir,
                client.clone(),
                requests.clone(),
                status.clone(),
                responses.clone(),
                histogram.clone(),
            )?);
        }

        let mut handles = Vec::with_capacity(count);
        for (index, fetcher) in fetchers.into_iter().enumerate() {
            let token = token.clone();
            let handle = thread::Builder::new()
                .name(format!("fetcher-{index}"))
                .spawn(move || fetcher.run(&token))
                .map_err(|err| FetchError::Spawn(err.to_string()))?;
            handles.push(handle);
        }

        debug!(workers = count, "fetcher pool started");
        Ok(Self { handles })
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers. Never true for a spawned pool.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("fetcher worker panicked");
            }
        }
    }
}
