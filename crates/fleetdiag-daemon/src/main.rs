//! fleetdiag-daemon — cluster diagnostics bundler.
//!
//! Serves the diagnostics API under `/system/health/v1`: the bundle
//! lifecycle, the legacy cluster-wide job, the self-describing logs index,
//! and Prometheus metrics at `/metrics`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetdiag_core::bundle::BundleManager;
use fleetdiag_core::catalog::EndpointCatalog;
use fleetdiag_core::collector::{Collector, CommandCollector, FileCollector};
use fleetdiag_core::config::DiagnosticsConfig;
use fleetdiag_core::job::DiagnosticsJob;
use fleetdiag_core::metrics::DiagnosticsMetrics;
use fleetdiag_core::node::{NodeDiscovery, StaticDiscovery};
use fleetdiag_daemon::capabilities::{DfDiskUsage, JournalctlReader};
use fleetdiag_daemon::{router, AppState};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// fleetdiag daemon - cluster diagnostics bundler
#[derive(Parser, Debug)]
#[command(name = "fleetdiag-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "fleetdiag.toml")]
    config: PathBuf,

    /// Web server TCP port
    #[arg(long)]
    port: Option<u16>,

    /// TCP port to reach master nodes on
    #[arg(long)]
    master_port: Option<u16>,

    /// TCP port to reach agent nodes on
    #[arg(long)]
    agent_port: Option<u16>,

    /// Directory to store diagnostic bundles in
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Endpoint descriptor file; may be given multiple times, later files
    /// override earlier ones
    #[arg(long = "endpoint-config")]
    endpoint_config: Vec<PathBuf>,

    /// Node inventory file for discovery
    #[arg(long, default_value = "/etc/fleetdiag/nodes.json")]
    nodes_file: PathBuf,

    /// Number of concurrent fetchers gathering node logs
    #[arg(long)]
    fetchers_count: Option<usize>,

    /// Use HTTPS for all constructed node URLs
    #[arg(long)]
    force_tls: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Configuration from the file, overridden by explicit flags.
    fn into_config(self) -> Result<(DiagnosticsConfig, PathBuf)> {
        let mut cfg = if self.config.exists() {
            DiagnosticsConfig::from_file(&self.config).context("failed to load configuration")?
        } else {
            DiagnosticsConfig::default()
        };

        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(port) = self.master_port {
            cfg.master_port = port;
        }
        if let Some(port) = self.agent_port {
            cfg.agent_port = port;
        }
        if let Some(workdir) = self.workdir {
            cfg.workdir = workdir;
        }
        if !self.endpoint_config.is_empty() {
            cfg.endpoint_config_files = self.endpoint_config;
        }
        if let Some(count) = self.fetchers_count {
            cfg.fetchers_count = count;
        }
        if self.force_tls {
            cfg.force_tls = true;
        }

        Ok((cfg, self.nodes_file))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (cfg, nodes_file) = args.into_config()?;
    info!(workdir = %cfg.workdir.display(), port = cfg.port, "starting fleetdiag daemon");

    let catalog = Arc::new(
        EndpointCatalog::load(&cfg.endpoint_config_files)
            .context("failed to load endpoint configuration")?,
    );
    if catalog.is_empty() {
        warn!("no endpoints configured, bundles will only carry summary reports");
    }

    let discovery = Arc::new(StaticDiscovery::new(nodes_file));
    let journal = Arc::new(JournalctlReader);
    let disk = Arc::new(DfDiskUsage);

    let registry = prometheus::Registry::new();
    let metrics =
        DiagnosticsMetrics::new(&registry).context("failed to register metrics")?;

    let role = discovery
        .node_role()
        .context("failed to determine the local node role")?;
    let mut local_collectors: Vec<Arc<dyn Collector>> = Vec::new();
    for (key, endpoint) in catalog.files_for_role(role) {
        local_collectors.push(Arc::new(FileCollector::new(key.clone(), endpoint)));
    }
    for (key, endpoint) in catalog.commands_for_role(role) {
        local_collectors.push(Arc::new(CommandCollector::new(key.clone(), endpoint)));
    }
    info!(role = %role, collectors = local_collectors.len(), "local collectors ready");

    let bundles = Arc::new(
        BundleManager::new(&cfg.workdir, cfg.collector_timeout, cfg.bundle_timeout)
            .context("failed to initialize the bundle workdir")?,
    );
    // The job controller owns blocking HTTP clients; build it off the
    // async runtime.
    let job = {
        let cfg = cfg.clone();
        let discovery = discovery.clone();
        tokio::task::spawn_blocking(move || DiagnosticsJob::new(cfg, discovery, disk, metrics))
            .await
            .context("job initialization task failed")?
            .context("failed to initialize the diagnostics job")?
    };
    let job = Arc::new(job);

    let state = AppState {
        cfg: Arc::new(cfg.clone()),
        job,
        bundles,
        catalog,
        discovery,
        journal,
        local_collectors: Arc::new(local_collectors),
        registry,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down cleanly");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = term.recv() => info!("received SIGTERM"),
            }
        }
        Err(err) => {
            warn!(%err, "could not install the SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}
