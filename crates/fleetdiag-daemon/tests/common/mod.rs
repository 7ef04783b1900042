//! Shared fixtures for the daemon integration tests.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetdiag_core::bundle::BundleManager;
use fleetdiag_core::cancel::CancelToken;
use fleetdiag_core::catalog::EndpointCatalog;
use fleetdiag_core::collector::{Collector, CollectorError, JournalReader};
use fleetdiag_core::config::DiagnosticsConfig;
use fleetdiag_core::job::DiagnosticsJob;
use fleetdiag_core::metrics::DiagnosticsMetrics;
use fleetdiag_core::node::{NoDiskUsage, StaticDiscovery};
use fleetdiag_daemon::{router, AppState};

/// Base path of the diagnostics API.
pub const BASE: &str = "/system/health/v1";

/// A daemon instance serving on an ephemeral port.
pub struct TestApp {
    /// `http://127.0.0.1:<port>` of the served router.
    pub base_url: String,

    /// Bundle working directory root.
    pub workdir: std::path::PathBuf,

    _tempdir: tempfile::TempDir,
}

/// Journal stub used where no journald exists.
struct NoJournal;

impl JournalReader for NoJournal {
    fn read_since(
        &self,
        unit: &str,
        _since: Duration,
    ) -> std::io::Result<Box<dyn Read + Send>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no journal for {unit}"),
        ))
    }
}

/// Build and serve a daemon around the given collectors and inventory.
///
/// `configure` may adjust the config after the defaults are set; the
/// inventory JSON is written to a file picked up by [`StaticDiscovery`].
pub async fn spawn_app(
    collectors: Vec<Arc<dyn Collector>>,
    inventory: serde_json::Value,
    configure: impl FnOnce(&mut DiagnosticsConfig),
) -> TestApp {
    let tempdir = tempfile::tempdir().unwrap();
    let nodes_file = tempdir.path().join("nodes.json");
    std::fs::write(&nodes_file, inventory.to_string()).unwrap();

    let mut cfg = DiagnosticsConfig {
        workdir: tempdir.path().join("bundles"),
        collector_timeout: Duration::from_millis(5),
        bundle_timeout: Duration::from_secs(5),
        ..DiagnosticsConfig::default()
    };
    configure(&mut cfg);

    let catalog = Arc::new(
        EndpointCatalog::load(&cfg.endpoint_config_files).expect("endpoint config loads"),
    );
    let discovery = Arc::new(StaticDiscovery::new(&nodes_file));
    let registry = prometheus::Registry::new();
    let metrics = DiagnosticsMetrics::new(&registry).unwrap();

    let bundles = Arc::new(
        BundleManager::new(&cfg.workdir, cfg.collector_timeout, cfg.bundle_timeout).unwrap(),
    );
    let job = {
        let cfg = cfg.clone();
        let discovery = discovery.clone();
        tokio::task::spawn_blocking(move || {
            DiagnosticsJob::new(cfg, discovery, Arc::new(NoDiskUsage), metrics)
        })
        .await
        .unwrap()
        .unwrap()
    };
    let job = Arc::new(job);

    let workdir = cfg.workdir.clone();
    let state = AppState {
        cfg: Arc::new(cfg),
        job,
        bundles,
        catalog,
        discovery,
        journal: Arc::new(NoJournal),
        local_collectors: Arc::new(collectors),
        registry,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        workdir,
        _tempdir: tempdir,
    }
}

/// Inventory with one local master node.
pub fn single_master_inventory() -> serde_json::Value {
    serde_json::json!({
        "local_ip": "127.0.0.1",
        "local_role": "master",
        "nodes": [
            {"ip": "127.0.0.1", "role": "master", "leader": true}
        ]
    })
}

/// A scripted collector for lifecycle tests.
pub struct MockCollector {
    name: &'static str,
    optional: bool,
    body: Option<&'static str>,
    error: Option<&'static str>,
    slow: bool,
}

impl MockCollector {
    pub fn ok(name: &'static str, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            optional: false,
            body: Some(body),
            error: None,
            slow: false,
        })
    }

    pub fn failing(name: &'static str, error: &'static str, optional: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            optional,
            body: None,
            error: Some(error),
            slow: false,
        })
    }

    pub fn slow(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            optional: false,
            body: None,
            error: None,
            slow: true,
        })
    }
}

/// Never produces data or EOF; runs into the collector deadline.
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

/// Poll a bundle until it reaches the wanted status.
pub async fn wait_for_status(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
    wanted: &str,
) -> serde_json::Value {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let bundle: serde_json::Value = client
            .get(format!("{base_url}{BASE}/report/diagnostics/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if bundle["status"] == wanted {
            return bundle;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "bundle {id} never became {wanted}: {bundle}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
