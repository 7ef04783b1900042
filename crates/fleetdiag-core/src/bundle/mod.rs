//! Bundle lifecycle: metadata types, persistence, and the manager.
//!
//! Every bundle owns a working directory `<workdir>/<id>/` holding a
//! `state.json` record and the `file.zip` archive. The state file is the
//! source of truth for everything except the archive size, which is always
//! derived from disk.

mod manager;
mod store;

pub use manager::{BundleError, BundleManager};
pub use store::{atomic_write_json, read_json, StoreError, MAX_STATE_FILE_SIZE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the per-bundle state file.
pub const STATE_FILE: &str = "state.json";

/// Name of the per-bundle archive.
pub const DATA_FILE: &str = "file.zip";

/// What a bundle covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BundleType {
    /// Artifacts of the local node only.
    #[default]
    Local,
    /// Artifacts collected across the cluster.
    Cluster,
}

/// Lifecycle status of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BundleStatus {
    /// State cannot be determined (no or unreadable state, missing archive).
    #[default]
    Unknown,
    /// The bundle directory was created and collection is about to start.
    Started,
    /// Collection is running.
    InProgress,
    /// Collection finished; the archive is available. May carry errors.
    Done,
    /// Collection was canceled.
    Canceled,
    /// The archive was deleted; metadata is retained.
    Deleted,
    /// Collection failed structurally; no usable archive.
    Failed,
}

impl BundleStatus {
    /// Whether the status ends the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Deleted | Self::Failed)
    }
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Started => "Started",
            Self::InProgress => "InProgress",
            Self::Done => "Done",
            Self::Canceled => "Canceled",
            Self::Deleted => "Deleted",
            Self::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// A bundle's lifecycle record, as persisted in `state.json` and served over
/// the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Opaque bundle identifier; also the working directory name.
    pub id: String,

    /// What the bundle covers.
    #[serde(rename = "type", default)]
    pub kind: BundleType,

    /// Lifecycle status.
    #[serde(default)]
    pub status: BundleStatus,

    /// When collection started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the lifecycle reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,

    /// Archive size in bytes. Derived from disk, never trusted from state.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    /// Errors accumulated during collection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(size: &u64) -> bool {
    *size == 0
}

impl Bundle {
    /// Record for a directory whose state cannot be determined.
    #[must_use]
    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BundleType::Local,
            status: BundleStatus::Unknown,
            started_at: None,
            stopped_at: None,
            size: 0,
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_round_trips_through_json() {
        let bundle = Bundle {
            id: "bundle-0".to_string(),
            kind: BundleType::Cluster,
            status: BundleStatus::Done,
            started_at: Some("1991-05-21T00:00:00Z".parse().unwrap()),
            stopped_at: Some("2019-05-21T00:00:00Z".parse().unwrap()),
            size: 618,
            errors: vec!["could not collect c1: some error".to_string()],
        };

        let raw = serde_json::to_string(&bundle).unwrap();
        let back: Bundle = serde_json::from_str(&raw).unwrap();
        assert_eq!(bundle, back);
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let raw = serde_json::to_string(&Bundle::unknown("bundle-1")).unwrap();
        assert_eq!(raw, r#"{"id":"bundle-1","type":"Local","status":"Unknown"}"#);
    }

    #[test]
    fn test_status_names_match_wire_format() {
        assert_eq!(
            serde_json::to_string(&BundleStatus::InProgress).unwrap(),
            r#""InProgress""#
        );
        assert_eq!(BundleStatus::Deleted.to_string(), "Deleted");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BundleStatus::Done.is_terminal());
        assert!(BundleStatus::Deleted.is_terminal());
        assert!(!BundleStatus::Started.is_terminal());
        assert!(!BundleStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_parses_state_written_by_older_daemons() {
        // Older records may lack size and errors entirely.
        let bundle: Bundle = serde_json::from_str(
            r#"{
                "id": "bundle",
                "type": "Local",
                "status": "Deleted",
                "started_at": "1991-05-21T00:00:00Z",
                "stopped_at": "2019-05-21T00:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(bundle.status, BundleStatus::Deleted);
        assert_eq!(bundle.size, 0);
        assert!(bundle.errors.is_empty());
    }
}
