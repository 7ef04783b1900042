//! Cluster-wide collection as a lifecycle-bundle collector.

use std::io::Read;
use std::sync::Arc;

use tracing::{info, warn};

use super::DiagnosticsJob;
use crate::cancel::CancelToken;
use crate::collector::{Collector, CollectorError};
use crate::node::Node;

/// Collector producing one archive entry holding a nested ZIP with the
/// artifacts of the selected cluster nodes.
///
/// This is how a lifecycle bundle created with `{"masters": …, "agents": …}`
/// reaches beyond the local node: the fetch pipeline runs against the
/// selected nodes and its merged archive becomes the entry body. Partial
/// fetch failures are recorded inside the nested archive's
/// `summaryErrorsReport.txt`; only a structurally failed run errors the
/// collector.
pub struct ClusterCollector {
    job: Arc<DiagnosticsJob>,
    include_masters: bool,
    include_agents: bool,
}

impl ClusterCollector {
    /// Collector covering the selected node groups.
    #[must_use]
    pub fn new(job: Arc<DiagnosticsJob>, include_masters: bool, include_agents: bool) -> Self {
        Self {
            job,
            include_masters,
            include_agents,
        }
    }

    fn nodes(&self) -> Result<Vec<Node>, CollectorError> {
        let mut nodes = Vec::new();
        if self.include_masters {
            let masters = self
                .job
                .discovery
                .master_nodes()
                .map_err(|err| CollectorError::Failed(err.to_string()))?;
            nodes.extend(masters);
        }
        if self.include_agents {
            let agents = self
                .job
                .discovery
                .agent_nodes()
                .map_err(|err| CollectorError::Failed(err.to_string()))?;
            nodes.extend(agents);
        }
        if nodes.is_empty() {
            return Err(CollectorError::Failed(
                "no nodes to collect from".to_string(),
            ));
        }
        Ok(nodes)
    }
}

impl Collector for ClusterCollector {
    fn name(&self) -> &str {
        "cluster.zip"
    }

    fn optional(&self) -> bool {
        false
    }

    fn collect(&self, token: &CancelToken) -> Result<Box<dyn Read + Send>, CollectorError> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }
        let nodes = self.nodes()?;
        info!(nodes = nodes.len(), "collecting a cluster archive");

        let (_, path) = tempfile::Builder::new()
            .prefix("cluster-")
            .suffix(".zip")
            .tempfile_in(&self.job.cfg.workdir)
            .and_then(|f| f.keep().map_err(Into::into))
            .map_err(|err| CollectorError::Failed(err.to_string()))?;

        if let Err(err) = self.job.build_archive(token, &nodes, &path) {
            let _ = std::fs::remove_file(&path);
            return Err(CollectorError::Failed(err));
        }

        let file = std::fs::File::open(&path)
            .map_err(|err| CollectorError::Failed(err.to_string()))?;
        // The file stays readable through the open handle; unlinking now
        // keeps the workdir free of leftovers whatever happens downstream.
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), %err, "could not unlink the cluster temp archive");
        }
        Ok(Box::new(file))
    }
}
