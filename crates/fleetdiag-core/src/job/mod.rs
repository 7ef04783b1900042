//! The legacy cluster-wide diagnostics job controller.
//!
//! One coordinator runs at most one cluster-wide collection at a time. The
//! controller admits requests, resolves node tokens, launches the collection
//! in the background, and aggregates status across peer coordinators.

mod cluster;
mod orchestrator;

pub use cluster::ClusterCollector;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{DiagnosticsConfig, API_VERSION, BASE_ROUTE};
use crate::metrics::DiagnosticsMetrics;
use crate::node::{DiscoveryError, DiskUsage, Node, NodeDiscovery, Role};

/// Node token selecting every discovered node.
pub const ALL: &str = "all";

/// Node token selecting master nodes.
pub const MASTERS: &str = "masters";

/// Node token selecting agent and public-agent nodes.
pub const AGENTS: &str = "agents";

/// Timeout for one peer status or list call.
const PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// Body of `POST /report/diagnostics/create`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleCreateRequest {
    /// Node tokens: `all`, `masters`, `agents`, or an ip / hostname / id.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Envelope of every legacy API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyResponse {
    /// HTTP status the handler should answer with.
    #[serde(rename = "response_http_code")]
    pub response_code: u16,

    /// API version.
    pub version: u32,

    /// Human-readable outcome.
    pub status: String,

    /// Errors, when any were recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl LegacyResponse {
    /// A 200 response with the given status message.
    #[must_use]
    pub fn ok(status: impl Into<String>) -> Self {
        Self {
            response_code: 200,
            version: API_VERSION,
            status: status.into(),
            errors: Vec::new(),
        }
    }

    /// An error response carrying its HTTP status code.
    #[must_use]
    pub fn error(code: u16, status: impl Into<String>) -> Self {
        Self {
            response_code: code,
            version: API_VERSION,
            status: status.into(),
            errors: Vec::new(),
        }
    }
}

/// Response of the legacy create operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponse {
    /// Common envelope.
    #[serde(flatten)]
    pub response: LegacyResponse,

    /// Create-specific payload.
    #[serde(default)]
    pub extra: CreateExtra,
}

/// Extra payload of the create response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateExtra {
    /// Filename of the bundle being collected.
    #[serde(rename = "bundle_name")]
    pub bundle_name: String,
}

impl CreateResponse {
    fn error(code: u16, status: impl Into<String>) -> Self {
        Self {
            response: LegacyResponse::error(code, status),
            extra: CreateExtra::default(),
        }
    }
}

/// Status report of one coordinator, local or peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleReportStatus {
    /// Whether a job is running on this coordinator.
    #[serde(rename = "is_running")]
    pub running: bool,

    /// Last status message.
    pub status: String,

    /// Errors recorded by the last run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Where the last bundle was (or will be) written.
    #[serde(rename = "last_bundle_dir", default)]
    pub last_bundle_path: String,

    /// When the last run started, RFC 3339.
    #[serde(default)]
    pub job_started: String,

    /// When the last run ended, RFC 3339. Empty while running.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_ended: String,

    /// Duration of the last run. Empty while running.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_duration: String,

    /// Progress of the running job, percent. `-1` before the first run.
    #[serde(default)]
    pub job_progress_percentage: f32,

    /// Root directory bundles are written to.
    #[serde(rename = "diagnostics_bundle_dir", default)]
    pub bundle_dir: String,

    /// Whole-job timeout, minutes.
    #[serde(rename = "diagnostics_job_timeout_min", default)]
    pub job_timeout_min: u64,

    /// How far back unit journals are collected.
    #[serde(rename = "journald_logs_since", default)]
    pub units_logs_since: String,

    /// Per-endpoint GET timeout, minutes.
    #[serde(rename = "diagnostics_job_get_single_url_timeout_min", default)]
    pub get_single_url_timeout_min: u64,

    /// Local command timeout, seconds.
    #[serde(rename = "command_exec_timeout_sec", default)]
    pub command_exec_timeout_sec: u64,

    /// Used disk share of the bundle partition, percent.
    #[serde(rename = "diagnostics_partition_disk_usage_percent", default)]
    pub disk_used_percent: f64,
}

/// One locally stored legacy bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyBundle {
    /// Bundle file path on its host.
    #[serde(rename = "file_name")]
    pub file: String,

    /// Size in bytes.
    #[serde(rename = "file_size")]
    pub size: u64,
}

/// Where a named bundle was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleLocation {
    /// On this coordinator.
    Local(PathBuf),
    /// On a peer coordinator.
    Remote {
        /// Peer address.
        node: IpAddr,
        /// Bundle file path on the peer.
        file: String,
    },
}

/// Controller failures that do not map to a legacy response directly.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// An HTTP client could not be constructed.
    #[error("could not build HTTP client: {0}")]
    Client(String),

    /// Discovery failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// No usable node tokens.
    #[error("no nodes were requested")]
    NoNodesRequested,

    /// Discovery returned an empty cluster.
    #[error("can't find any nodes")]
    NoClusterNodes,

    /// None of the requested tokens matched a node.
    #[error("requested nodes: {0:?} not found")]
    NodesNotFound(Vec<String>),

    /// Cluster-wide status could not be established.
    #[error("could not determine whether the diagnostics job is running or not: {0}")]
    StatusAll(String),
}

/// Mutable job state, owned by one lock.
///
/// The original implementation guarded progress, status, errors and the
/// running flag with four separate locks; a single owner with snapshot reads
/// is simpler and contention here is negligible.
#[derive(Debug, Default)]
struct JobState {
    running: bool,
    status: String,
    errors: Vec<String>,
    last_bundle_path: PathBuf,
    job_started: Option<DateTime<Utc>>,
    job_ended: Option<DateTime<Utc>>,
    progress: f32,
    cancel: Option<CancelToken>,
}

/// The cluster-wide diagnostics job controller.
pub struct DiagnosticsJob {
    cfg: DiagnosticsConfig,
    discovery: Arc<dyn NodeDiscovery>,
    disk: Arc<dyn DiskUsage>,
    metrics: DiagnosticsMetrics,
    /// Client for endpoint fetches, bounded by the configured fetch timeout.
    client: reqwest::blocking::Client,
    /// Client for peer coordination calls, bounded by [`PEER_TIMEOUT`].
    peer_client: reqwest::blocking::Client,
    state: Mutex<JobState>,
}

impl DiagnosticsJob {
    /// Build a controller.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Client`] when an HTTP client cannot be built.
    pub fn new(
        cfg: DiagnosticsConfig,
        discovery: Arc<dyn NodeDiscovery>,
        disk: Arc<dyn DiskUsage>,
        metrics: DiagnosticsMetrics,
    ) -> Result<Self, JobError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(cfg.fetch_timeout)
            .build()
            .map_err(|err| JobError::Client(err.to_string()))?;
        let peer_client = reqwest::blocking::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .map_err(|err| JobError::Client(err.to_string()))?;

        let state = JobState {
            // Progress of -1 means the job has never been executed.
            progress: -1.0,
            ..JobState::default()
        };

        Ok(Self {
            cfg,
            discovery,
            disk,
            metrics,
            client,
            peer_client,
            state: Mutex::new(state),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &DiagnosticsConfig {
        &self.cfg
    }

    fn state(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Admit and start a cluster-wide collection.
    ///
    /// The returned response carries the HTTP status the caller should
    /// answer with: 400 for agent callers, 409 when a job is already
    /// running, 503 when discovery or node resolution fails.
    pub fn run(self: &Arc<Self>, request: &BundleCreateRequest) -> CreateResponse {
        let role = match self.discovery.node_role() {
            Ok(role) => role,
            Err(err) => return CreateResponse::error(503, err.to_string()),
        };
        if role.is_agent() {
            return CreateResponse::error(
                400,
                "running diagnostics job on agent node is not implemented",
            );
        }

        match self.is_running() {
            Ok((false, _)) => {}
            Ok((true, _)) => return CreateResponse::error(409, "Job is already running"),
            Err(err) => return CreateResponse::error(503, err.to_string()),
        }

        let nodes = match self.find_requested_nodes(&request.nodes) {
            Ok(nodes) => nodes,
            Err(err) => return CreateResponse::error(503, err.to_string()),
        };
        debug!(count = nodes.len(), "resolved requested nodes");

        if !self.cfg.workdir.exists() {
            info!(dir = %self.cfg.workdir.display(), "bundle directory not found, creating it");
            if let Err(err) = std::fs::create_dir_all(&self.cfg.workdir) {
                let message =
                    format!("could not create directory: {}: {err}", self.cfg.workdir.display());
                self.set_status(&message);
                return CreateResponse::error(503, message);
            }
        }

        let now = Utc::now();
        let bundle_name = format!(
            "bundle-{}-{:02}-{:02}-{}.zip",
            now.year(),
            now.month(),
            now.day(),
            now.timestamp()
        );
        let bundle_path = self.cfg.workdir.join(&bundle_name);
        let token = CancelToken::with_timeout(self.cfg.job_timeout);

        {
            let mut state = self.state();
            state.errors.clear();
            state.last_bundle_path.clone_from(&bundle_path);
            state.status = format!(
                "Diagnostics job started, archive will be available at: {}",
                bundle_path.display()
            );
            state.cancel = Some(token.clone());
            state.job_started = Some(now);
            state.job_ended = None;
            state.running = true;
            state.progress = 0.0;
        }

        let job = Arc::clone(self);
        std::thread::spawn(move || {
            let started = Instant::now();
            job.run_background_job(&token, &nodes);
            let elapsed = started.elapsed().as_secs_f64();
            job.metrics.observe_bundle_creation(elapsed);
        });

        CreateResponse {
            response: LegacyResponse::ok("Job has been successfully started"),
            extra: CreateExtra { bundle_name },
        }
    }

    /// Cancel the running job, locally or on the peer that runs it.
    /// Idempotent: canceling an idle cluster answers 503.
    pub fn cancel(&self) -> LegacyResponse {
        match self.discovery.node_role() {
            Ok(role) if role.is_agent() => {
                return LegacyResponse::error(
                    503,
                    "canceling diagnostics job on agent node is not implemented",
                );
            }
            Ok(_) => {}
            // The role could not be detected; still try to cancel.
            Err(err) => warn!(%err, "could not detect node role"),
        }

        let (running, node) = match self.is_running() {
            Ok(result) => result,
            Err(err) => return LegacyResponse::error(503, err.to_string()),
        };
        if !running {
            return LegacyResponse::error(503, "Job is not running");
        }

        match node {
            None => {
                if let Some(token) = self.state().cancel.clone() {
                    token.cancel();
                }
                debug!("canceling the local job");
                LegacyResponse::ok("Attempting to cancel a job, please check job status.")
            }
            Some(peer) => {
                let url = format!(
                    "http://{peer}:{}{BASE_ROUTE}/report/diagnostics/cancel",
                    self.cfg.master_port
                );
                let status = format!("Attempting to cancel a job on a remote host. POST {url}");
                debug!(%status);
                self.set_status(&status);
                match self.peer_client.post(&url).send().and_then(|r| r.json()) {
                    Ok(remote) => remote,
                    Err(err) => LegacyResponse::error(503, err.to_string()),
                }
            }
        }
    }

    /// Whether a job runs anywhere, and on which peer if not local.
    fn is_running(&self) -> Result<(bool, Option<IpAddr>), JobError> {
        if self.state().running {
            return Ok((true, None));
        }
        let statuses = self.status_all()?;
        let local_ip = self.discovery.local_ip().ok().map(|ip| ip.to_string());
        for (node, status) in statuses {
            if status.running && Some(&node) != local_ip.as_ref() {
                let ip = node.parse().map_err(|_| {
                    JobError::StatusAll(format!("peer address {node} is not an IP"))
                })?;
                return Ok((true, Some(ip)));
            }
        }
        Ok((false, None))
    }

    /// Local status report.
    #[must_use]
    pub fn status(&self) -> BundleReportStatus {
        let disk_used = self
            .disk
            .used_percent(&self.cfg.workdir)
            .unwrap_or_default();

        let state = self.state();
        let (job_ended, job_duration) = if state.running {
            (String::new(), String::new())
        } else {
            match (state.job_started, state.job_ended) {
                (Some(started), Some(ended)) => (
                    ended.to_rfc3339(),
                    format!("{}s", (ended - started).num_seconds()),
                ),
                _ => (String::new(), String::new()),
            }
        };

        BundleReportStatus {
            running: state.running,
            status: state.status.clone(),
            errors: state.errors.clone(),
            last_bundle_path: state.last_bundle_path.display().to_string(),
            job_started: state.job_started.map(|t| t.to_rfc3339()).unwrap_or_default(),
            job_ended,
            job_duration,
            job_progress_percentage: state.progress,
            bundle_dir: self.cfg.workdir.display().to_string(),
            job_timeout_min: self.cfg.job_timeout.as_secs() / 60,
            units_logs_since: humantime::format_duration(self.cfg.units_logs_since).to_string(),
            get_single_url_timeout_min: self.cfg.fetch_timeout.as_secs() / 60,
            command_exec_timeout_sec: self.cfg.command_timeout.as_secs(),
            disk_used_percent: disk_used,
        }
    }

    /// Status of every master coordinator, keyed by address.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when no master can be discovered or any peer
    /// cannot be queried; the local entry is always required.
    pub fn status_all(&self) -> Result<std::collections::BTreeMap<String, BundleReportStatus>, JobError> {
        let masters = self.discovery.master_nodes()?;
        if masters.is_empty() {
            return Err(JobError::StatusAll("could not find any master".to_string()));
        }

        let mut statuses = std::collections::BTreeMap::new();
        let mut problems = Vec::new();

        let local_ip = match self.discovery.local_ip() {
            Ok(ip) => {
                statuses.insert(ip.to_string(), self.status());
                Some(ip)
            }
            Err(err) => {
                warn!(%err, "could not detect the local address");
                None
            }
        };

        for master in masters {
            if Some(master.ip) == local_ip {
                continue;
            }
            let url = format!(
                "http://{}:{}{BASE_ROUTE}/report/diagnostics/status",
                master.ip, self.cfg.master_port
            );
            let response = self.peer_client.get(&url).send();
            match response {
                Ok(response) if response.status().is_success() => {
                    match response.json::<BundleReportStatus>() {
                        Ok(status) => {
                            statuses.insert(master.ip.to_string(), status);
                        }
                        Err(err) => {
                            error!(ip = %master.ip, %err, "could not parse a peer status");
                            problems
                                .push(format!("could not determine job status for master {}: {err}", master.ip));
                        }
                    }
                }
                Ok(response) => {
                    error!(%url, code = %response.status(), "could not get peer status");
                    problems.push(format!(
                        "could not get data from {url} got {} status",
                        response.status().as_u16()
                    ));
                }
                Err(err) => {
                    error!(%url, %err, "could not get peer status");
                    problems.push(format!("could not get data from {url}: {err}"));
                }
            }
        }

        if statuses.is_empty() || !problems.is_empty() {
            return Err(JobError::StatusAll(problems.join("; ")));
        }
        Ok(statuses)
    }

    /// Legacy bundles stored on this coordinator, with sizes.
    ///
    /// The bundle of a running job is skipped.
    #[must_use]
    pub fn list_local_bundles(&self) -> Vec<LegacyBundle> {
        let (running, current) = {
            let state = self.state();
            (state.running, state.last_bundle_path.clone())
        };

        let Ok(entries) = std::fs::read_dir(&self.cfg.workdir) else {
            return Vec::new();
        };

        let mut bundles = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("bundle-") || !name.ends_with(".zip") {
                continue;
            }
            if running && path == current {
                info!(path = %path.display(), "skipped listing, the job is running");
                continue;
            }
            let size = entry.metadata().map_or(0, |meta| meta.len());
            bundles.push(LegacyBundle {
                file: path.display().to_string(),
                size,
            });
        }
        bundles.sort_by(|a, b| a.file.cmp(&b.file));
        bundles
    }

    /// Legacy bundles of every master coordinator, keyed by `host:port`.
    /// Peers that cannot be queried are skipped.
    #[must_use]
    pub fn list_all_bundles(&self) -> std::collections::BTreeMap<String, Vec<LegacyBundle>> {
        let mut collected = std::collections::BTreeMap::new();
        let Ok(masters) = self.discovery.master_nodes() else {
            return collected;
        };
        let local_ip = self.discovery.local_ip().ok();

        for master in masters {
            let host = format!("{}:{}", master.ip, self.cfg.master_port);
            if Some(master.ip) == local_ip {
                collected.insert(host, self.list_local_bundles());
                continue;
            }
            let url = format!("http://{host}{BASE_ROUTE}/report/diagnostics/list");
            match self.peer_client.get(&url).send().and_then(|r| r.json()) {
                Ok(bundles) => {
                    collected.insert(host, bundles);
                }
                Err(err) => {
                    error!(%url, %err, "could not list peer bundles");
                }
            }
        }
        collected
    }

    /// Find a named bundle locally, then across peers.
    #[must_use]
    pub fn locate_bundle(&self, name: &str) -> Option<BundleLocation> {
        for bundle in self.list_local_bundles() {
            let path = PathBuf::from(&bundle.file);
            if path.file_name().and_then(|n| n.to_str()) == Some(name) {
                return Some(BundleLocation::Local(path));
            }
        }

        for (host, bundles) in self.list_all_bundles() {
            for bundle in bundles {
                let base = PathBuf::from(&bundle.file);
                if base.file_name().and_then(|n| n.to_str()) != Some(name) {
                    continue;
                }
                let ip = host.split(':').next().and_then(|h| h.parse().ok())?;
                return Some(BundleLocation::Remote {
                    node: ip,
                    file: bundle.file,
                });
            }
        }
        None
    }

    /// Delete a named legacy bundle, forwarding to the peer that holds it
    /// when it is not local.
    #[must_use]
    pub fn delete(&self, name: &str) -> LegacyResponse {
        if !name.starts_with("bundle-") || !name.ends_with(".zip") {
            return LegacyResponse::error(400, "format allowed bundle-*.zip");
        }

        let path = self.cfg.workdir.join(name);
        debug!(path = %path.display(), "trying to remove a bundle");
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                return LegacyResponse::error(503, err.to_string());
            }
            let message = format!("Deleted {}", path.display());
            info!(%message);
            self.set_status(&message);
            return LegacyResponse::ok(message);
        }

        match self.locate_bundle(name) {
            Some(BundleLocation::Remote { node, .. }) => {
                let url = format!(
                    "http://{node}:{}{BASE_ROUTE}/report/diagnostics/delete/{name}",
                    self.cfg.master_port
                );
                let status = format!("Attempting to delete a bundle on a remote host. POST {url}");
                debug!(%status);
                self.set_status(&status);
                match self.peer_client.post(&url).send().and_then(|r| r.json::<LegacyResponse>()) {
                    Ok(remote) => {
                        self.set_status(&remote.status);
                        remote
                    }
                    Err(err) => LegacyResponse::error(503, err.to_string()),
                }
            }
            Some(BundleLocation::Local(_)) | None => {
                let status = format!("Bundle not found {name}");
                self.set_status(&status);
                LegacyResponse::error(404, status)
            }
        }
    }

    /// Resolve node tokens against discovery.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when discovery fails or nothing matches.
    pub fn find_requested_nodes(&self, requested: &[String]) -> Result<Vec<Node>, JobError> {
        let masters = self.discovery.master_nodes()?;
        let agents = self.discovery.agent_nodes()?;
        match_requested_nodes(requested, &masters, &agents)
    }

    fn set_status(&self, status: &str) {
        self.state().status = status.to_string();
    }

    fn append_error(&self, error: String) {
        self.state().errors.push(error);
    }

    fn stop(&self) {
        let mut state = self.state();
        state.running = false;
        state.job_ended = Some(Utc::now());
        info!("job finished");
    }
}

/// Match node tokens against the discovered cluster.
fn match_requested_nodes(
    requested: &[String],
    masters: &[Node],
    agents: &[Node],
) -> Result<Vec<Node>, JobError> {
    if requested.iter().all(String::is_empty) {
        return Err(JobError::NoNodesRequested);
    }
    let cluster: Vec<&Node> = masters.iter().chain(agents).collect();
    if cluster.is_empty() {
        return Err(JobError::NoClusterNodes);
    }

    let mut matched: Vec<Node> = Vec::new();
    for token in requested {
        if token.is_empty() {
            continue;
        }
        if token == ALL {
            return Ok(cluster.into_iter().cloned().collect());
        }
        if token == MASTERS {
            matched.extend_from_slice(masters);
        }
        if token == AGENTS {
            matched.extend_from_slice(agents);
        }
        for node in &cluster {
            let ip_match = token == &node.ip.to_string();
            let host_match = node.host.as_deref() == Some(token.as_str());
            let id_match = node.id.as_deref() == Some(token.as_str());
            if ip_match || host_match || id_match {
                matched.push((*node).clone());
            }
        }
    }

    if matched.is_empty() {
        return Err(JobError::NodesNotFound(requested.to_vec()));
    }
    Ok(matched)
}
