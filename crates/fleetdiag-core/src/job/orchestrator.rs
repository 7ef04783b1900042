//! The collection run: node endpoint discovery, the fetcher pool, and the
//! final archive assembly.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;

use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info, warn};
use zip::ZipWriter;

use super::DiagnosticsJob;
use crate::archive::{self, ReportBuffer};
use crate::cancel::CancelToken;
use crate::catalog::LogEndpoint;
use crate::config::BASE_ROUTE;
use crate::fetcher::{EndpointRequest, FetcherPool, StatusUpdate};
use crate::node::Node;

/// Final status once any error was recorded.
const JOB_FAILED: &str = "Diagnostics job failed";

/// Final status of a clean run.
const JOB_SUCCEEDED: &str = "Diagnostics job successfully collected all data";

impl DiagnosticsJob {
    /// Run the legacy cluster-wide collection to completion.
    pub(super) fn run_background_job(&self, token: &CancelToken, nodes: &[Node]) {
        info!("started background job");

        if nodes.is_empty() {
            self.set_status(JOB_FAILED);
            self.append_error("nodes length must NOT be 0".to_string());
            self.stop();
            return;
        }

        let archive_path = self.state().last_bundle_path.clone();
        if let Err(err) = self.build_archive(token, nodes, &archive_path) {
            error!(%err, "diagnostics job failed");
            self.append_error(err);
        }

        let status = if self.state().errors.is_empty() {
            JOB_SUCCEEDED
        } else {
            warn!("diagnostics job recorded errors");
            JOB_FAILED
        };
        self.set_status(status);
        self.state().progress = 100.0;
        self.stop();
    }

    /// Collect artifacts of `nodes` into a fresh archive at `path`.
    ///
    /// Individual endpoint failures are accumulated; only a structural
    /// failure (the archive itself cannot be produced) is returned as an
    /// error.
    pub(super) fn build_archive(
        &self,
        token: &CancelToken,
        nodes: &[Node],
        path: &Path,
    ) -> Result<(), String> {
        let file = File::create(path)
            .map_err(|err| format!("could not create zip file {}: {err}", path.display()))?;
        let mut zip = ZipWriter::new(file);

        // summaryReport is the log of the collection run;
        // summaryErrorsReport records what failed.
        let mut summary = ReportBuffer::new();
        let mut errors_report = ReportBuffer::new();

        let temp_zips = self.collect_from_nodes(token, nodes, &mut summary, &mut errors_report);

        for temp in temp_zips {
            if let Err(err) = archive::append_archive(&mut zip, &temp) {
                self.log_error(&err, "could not create a bundle", &mut errors_report);
            }
            if let Err(err) = std::fs::remove_file(&temp) {
                self.log_error(&err, "could not remove temporary file", &mut errors_report);
            }
        }

        if let Err(err) = archive::write_entry(&mut zip, "summaryReport.txt", summary.as_bytes()) {
            self.log_error(&err, "could not append a report to the archive", &mut errors_report);
        }
        if !errors_report.is_empty() {
            if let Err(err) =
                archive::write_entry(&mut zip, "summaryErrorsReport.txt", errors_report.as_bytes())
            {
                error!(%err, "could not append the errors report to the archive");
                self.append_error(err.to_string());
            }
        }

        zip.finish()
            .map(|_| ())
            .map_err(|err| format!("could not finalize zip file {}: {err}", path.display()))
    }

    /// Feed the fetcher pool and drain it: M status updates, N responses.
    fn collect_from_nodes(
        &self,
        token: &CancelToken,
        nodes: &[Node],
        summary: &mut ReportBuffer,
        errors_report: &mut ReportBuffer,
    ) -> Vec<std::path::PathBuf> {
        let requests = self.endpoints_to_fetch(token, nodes, summary, errors_report);
        let optional_urls: HashSet<String> = requests
            .iter()
            .filter(|r| r.optional)
            .map(|r| r.url.clone())
            .collect();

        let (request_tx, request_rx) = bounded(requests.len().max(1));
        let total = requests.len();
        for request in requests {
            // The channel was sized for the batch; this cannot block.
            let _ = request_tx.send(request);
        }
        drop(request_tx);

        let (status_tx, status_rx) = bounded(0);
        let (response_tx, response_rx) = bounded(0);

        let pool = match FetcherPool::spawn(
            self.cfg.fetchers_count,
            &self.cfg.workdir,
            &self.client,
            &request_rx,
            &status_tx,
            &response_tx,
            &self.metrics.fetch_histogram(),
            token,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                self.log_error(&err, "could not start fetchers", errors_report);
                return Vec::new();
            }
        };
        drop(status_tx);
        drop(response_tx);

        self.wait_for_status_updates(token, &status_rx, total, &optional_urls, summary, errors_report);

        let mut temp_zips = Vec::with_capacity(pool.len());
        for _ in 0..pool.len() {
            match response_rx.recv() {
                Ok(response) => {
                    if let Some(err) = response.error {
                        self.log_error(&err, "failed to gather all results", errors_report);
                    }
                    temp_zips.push(response.zip_path);
                }
                Err(_) => break,
            }
        }

        if let Some(reason) = token.err() {
            self.log_error(&reason, "job cancelled", errors_report);
        }

        pool.join();
        temp_zips
    }

    /// Expand every node into endpoint requests and shuffle the batch.
    fn endpoints_to_fetch(
        &self,
        token: &CancelToken,
        nodes: &[Node],
        summary: &mut ReportBuffer,
        errors_report: &mut ReportBuffer,
    ) -> Vec<EndpointRequest> {
        let mut requests = Vec::with_capacity(nodes.len() * 10);
        for node in nodes {
            summary.add_line(&format!("START collecting logs {}", node.ip), "");
            let endpoints = match self.node_endpoints(node) {
                Ok(endpoints) => endpoints,
                Err(err) => {
                    self.log_error(&err, &node.ip.to_string(), errors_report);
                    continue;
                }
            };
            for (file_name, endpoint) in endpoints {
                if token.is_done() {
                    return requests;
                }
                let raw_url = format!("http://{}{}", node.ip, endpoint.port_and_path);
                let url = match use_tls_scheme(&raw_url, self.cfg.force_tls) {
                    Ok(url) => url,
                    Err(err) => {
                        self.log_error(
                            &format!("could not prepare URL: {err}"),
                            &node.ip.to_string(),
                            errors_report,
                        );
                        continue;
                    }
                };
                requests.push(EndpointRequest {
                    url,
                    node: node.clone(),
                    file_name: format!("{}_{}/{}", node.ip, node.role, file_name),
                    optional: endpoint.optional,
                });
            }
        }

        // Shuffle so that one slow or large host does not absorb the whole
        // pool at once.
        shuffle_requests(&mut requests, self.cfg.shuffle_seed);
        requests
    }

    /// Ask one node what it can provide.
    fn node_endpoints(&self, node: &Node) -> Result<BTreeMap<String, LogEndpoint>, String> {
        let port = self.cfg.pull_port(node.role);
        let url = format!("http://{}:{port}{BASE_ROUTE}/logs", node.ip);

        let response = self
            .peer_client
            .get(&url)
            .send()
            .map_err(|err| format!("could not get a list of logs, url: {url}: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "could not get a list of logs, url: {url}, status code {}",
                response.status().as_u16()
            ));
        }

        let endpoints: BTreeMap<String, LogEndpoint> = response
            .json()
            .map_err(|err| format!("could not unmarshal a list of logs from {url}: {err}"))?;
        if endpoints.is_empty() {
            return Err(format!("no endpoints found, url {url}"));
        }
        Ok(endpoints)
    }

    /// Read exactly `total` status updates, keeping progress and the reports
    /// current. Returns early when the token fires.
    fn wait_for_status_updates(
        &self,
        token: &CancelToken,
        status_rx: &Receiver<StatusUpdate>,
        total: usize,
        optional_urls: &HashSet<String>,
        summary: &mut ReportBuffer,
        errors_report: &mut ReportBuffer,
    ) {
        if total == 0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let percent_per_endpoint = 100.0 / total as f32;

        for _ in 0..total {
            let update = crossbeam_channel::select! {
                recv(status_rx) -> msg => match msg {
                    Ok(update) => update,
                    Err(_) => return,
                },
                recv(token.done()) -> _ => return,
                default(token.time_left()) => return,
            };

            self.state().progress += percent_per_endpoint;
            let detail = update
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            summary.add_line(&format!("GET {}", update.url), &detail);
            self.set_status(&format!("GET {}", update.url));

            if let Some(err) = update.error {
                if optional_urls.contains(&update.url) {
                    // Reported for visibility, but an optional endpoint never
                    // fails the bundle on its own.
                    warn!(url = %update.url, %err, "optional endpoint failed");
                    errors_report.add_line(&update.url, &err.to_string());
                } else {
                    self.log_error(&err, &update.url, errors_report);
                }
            }
        }
    }

    /// Record a collection error everywhere it is observable: the job state,
    /// the log, and the errors report.
    fn log_error(
        &self,
        err: &dyn std::fmt::Display,
        context: &str,
        errors_report: &mut ReportBuffer,
    ) {
        error!(context, "{err}");
        self.append_error(err.to_string());
        errors_report.add_line(context, &err.to_string());
    }
}

/// Rewrite `http://` to `https://` when the force-TLS option is on.
fn use_tls_scheme(raw: &str, force_tls: bool) -> Result<String, String> {
    if !force_tls {
        return Ok(raw.to_string());
    }
    let mut parsed = url::Url::parse(raw).map_err(|err| err.to_string())?;
    parsed
        .set_scheme("https")
        .map_err(|()| format!("could not set https scheme on {raw}"))?;
    Ok(parsed.to_string())
}

/// Uniformly shuffle the request batch; a fixed seed makes runs
/// reproducible.
fn shuffle_requests(requests: &mut [EndpointRequest], seed: Option<u64>) {
    match seed {
        Some(seed) => requests.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed)),
        None => requests.shuffle(&mut rand::thread_rng()),
    }
}
