//! Daemon configuration.
//!
//! A [`DiagnosticsConfig`] is deserialized from an optional TOML file and
//! then overridden field-by-field from command-line flags by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::Role;

/// Version tag carried in legacy API responses.
pub const API_VERSION: u32 = 1;

/// Base path of the diagnostics HTTP API.
pub const BASE_ROUTE: &str = "/system/health/v1";

/// Configuration for the diagnostics engine and its HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// TCP port this daemon serves on.
    pub port: u16,

    /// TCP port used to reach master nodes.
    pub master_port: u16,

    /// TCP port used to reach agent nodes.
    pub agent_port: u16,

    /// Root directory for bundle working directories.
    pub workdir: PathBuf,

    /// Ordered endpoint descriptor files; later files override earlier ones.
    pub endpoint_config_files: Vec<PathBuf>,

    /// How far back unit journals are collected.
    #[serde(with = "humantime_serde")]
    pub units_logs_since: Duration,

    /// Deadline for a whole legacy collection job.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Timeout for a single endpoint GET.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Timeout for one collector of a lifecycle bundle.
    #[serde(with = "humantime_serde")]
    pub collector_timeout: Duration,

    /// Deadline for a whole lifecycle bundle.
    #[serde(with = "humantime_serde")]
    pub bundle_timeout: Duration,

    /// Timeout for a local diagnostic command.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Number of concurrent fetcher workers.
    pub fetchers_count: usize,

    /// Rewrite constructed endpoint URLs from `http` to `https`.
    pub force_tls: bool,

    /// Fixed seed for the endpoint shuffle, for reproducible runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            port: 1050,
            master_port: 1050,
            agent_port: 61001,
            workdir: PathBuf::from("/var/lib/fleetdiag/bundles"),
            endpoint_config_files: Vec::new(),
            units_logs_since: Duration::from_secs(24 * 60 * 60),
            job_timeout: Duration::from_secs(720 * 60),
            fetch_timeout: Duration::from_secs(60),
            collector_timeout: Duration::from_secs(60),
            bundle_timeout: Duration::from_secs(60 * 60),
            command_timeout: Duration::from_secs(50),
            fetchers_count: 1,
            force_tls: false,
            shuffle_seed: None,
        }
    }
}

impl DiagnosticsConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Port to pull diagnostics from for a node of the given role.
    #[must_use]
    pub const fn pull_port(&self, role: Role) -> u16 {
        match role {
            Role::Master => self.master_port,
            Role::Agent | Role::AgentPublic => self.agent_port,
        }
    }
}

/// Configuration loading errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config file {}: {reason}", path.display())]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// The config file is not valid TOML.
    #[error("could not parse config file {}: {reason}", path.display())]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
