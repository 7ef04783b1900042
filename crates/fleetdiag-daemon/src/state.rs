//! Shared daemon state handed to every HTTP handler.

use std::sync::Arc;

use fleetdiag_core::bundle::BundleManager;
use fleetdiag_core::catalog::EndpointCatalog;
use fleetdiag_core::collector::{Collector, JournalReader};
use fleetdiag_core::config::DiagnosticsConfig;
use fleetdiag_core::job::DiagnosticsJob;
use fleetdiag_core::node::NodeDiscovery;

/// Everything a handler can reach.
#[derive(Clone)]
pub struct AppState {
    /// Engine configuration.
    pub cfg: Arc<DiagnosticsConfig>,

    /// The legacy cluster-wide job controller.
    pub job: Arc<DiagnosticsJob>,

    /// The bundle lifecycle manager.
    pub bundles: Arc<BundleManager>,

    /// Merged endpoint catalog.
    pub catalog: Arc<EndpointCatalog>,

    /// Node discovery capability.
    pub discovery: Arc<dyn NodeDiscovery>,

    /// Unit journal capability.
    pub journal: Arc<dyn JournalReader>,

    /// Collectors used for `Local` lifecycle bundles.
    pub local_collectors: Arc<Vec<Arc<dyn Collector>>>,

    /// Metrics registry backing the `/metrics` endpoint.
    pub registry: prometheus::Registry,
}
