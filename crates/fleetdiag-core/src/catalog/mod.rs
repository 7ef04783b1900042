//! Endpoint catalog.
//!
//! The catalog merges an ordered list of endpoint descriptor files and
//! resolves, per node role, the set of artifacts a node can provide. It also
//! produces the payload of the self-describing `GET /logs` index that
//! coordinators use to discover what to fetch from a node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BASE_ROUTE;
use crate::node::Role;

/// HTTP-exposed artifact on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    /// Port the endpoint is served on.
    pub port: u16,

    /// Request path.
    pub uri: String,

    /// Roles the endpoint applies to; empty means every role.
    #[serde(default)]
    pub roles: Vec<Role>,

    /// Archive filename override. Defaults to `<port>-<sanitized uri>.json`.
    #[serde(default)]
    pub file_name: Option<String>,

    /// Whether a fetch failure may fail the bundle.
    #[serde(default)]
    pub optional: bool,
}

/// Local file artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEndpoint {
    /// Absolute path of the file.
    pub location: PathBuf,

    /// Roles the endpoint applies to; empty means every role.
    #[serde(default)]
    pub roles: Vec<Role>,

    /// Whether a read failure may fail the bundle.
    #[serde(default)]
    pub optional: bool,
}

/// Local command artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEndpoint {
    /// Command and arguments. Never empty.
    pub command: Vec<String>,

    /// Roles the endpoint applies to; empty means every role.
    #[serde(default)]
    pub roles: Vec<Role>,

    /// Whether an execution failure may fail the bundle.
    #[serde(default)]
    pub optional: bool,
}

/// One artifact descriptor, any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointDescriptor {
    /// HTTP-exposed artifact.
    Http(HttpEndpoint),
    /// Local file.
    File(FileEndpoint),
    /// Local command output.
    Command(CommandEndpoint),
}

impl EndpointDescriptor {
    /// Whether the descriptor applies to a node of the given role.
    #[must_use]
    pub fn applies_to(&self, role: Role) -> bool {
        let roles = match self {
            Self::Http(e) => &e.roles,
            Self::File(e) => &e.roles,
            Self::Command(e) => &e.roles,
        };
        roles.is_empty() || roles.contains(&role)
    }

    /// Whether a collection failure is tolerated.
    #[must_use]
    pub const fn optional(&self) -> bool {
        match self {
            Self::Http(e) => e.optional,
            Self::File(e) => e.optional,
            Self::Command(e) => e.optional,
        }
    }
}

/// Entry of the `GET /logs` index.
///
/// The field names are the wire protocol between coordinators and peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEndpoint {
    /// Port-and-path suffix, e.g. `":1050/system/health/v1/logs/files/x"`.
    #[serde(rename = "PortAndPath")]
    pub port_and_path: String,

    /// Whether a fetch failure may fail the bundle.
    #[serde(rename = "Optional")]
    pub optional: bool,
}

/// Provider segment of a `/logs/{provider}/{entity}` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogProvider {
    /// Service-manager unit journals.
    Units,
    /// Local files.
    Files,
    /// Local command outputs.
    Cmds,
}

/// Shape of one endpoint descriptor file.
#[derive(Debug, Default, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    http: Vec<HttpEndpoint>,
    #[serde(default)]
    files: Vec<FileEndpoint>,
    #[serde(default)]
    commands: Vec<CommandEndpoint>,
}

/// Merged, keyed view of every configured endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointCatalog {
    http: BTreeMap<String, HttpEndpoint>,
    files: BTreeMap<String, FileEndpoint>,
    commands: BTreeMap<String, CommandEndpoint>,
}

impl EndpointCatalog {
    /// Load and merge descriptor files in order; later files override earlier
    /// entries with the same sanitized key.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when a file cannot be read or parsed, or a
    /// command descriptor has an empty argv.
    pub fn load(paths: &[PathBuf]) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        for path in paths {
            let parsed = read_descriptor_file(path)?;
            catalog.merge(parsed, path)?;
            debug!(path = %path.display(), "merged endpoint descriptor file");
        }
        Ok(catalog)
    }

    fn merge(&mut self, file: DescriptorFile, path: &Path) -> Result<(), CatalogError> {
        for endpoint in file.http {
            let key = match &endpoint.file_name {
                Some(name) => name.clone(),
                None => format!("{}-{}.json", endpoint.port, sanitize(&endpoint.uri)),
            };
            self.http.insert(key, endpoint);
        }
        for endpoint in file.files {
            let key = file_key(&endpoint.location);
            self.files.insert(key, endpoint);
        }
        for endpoint in file.commands {
            if endpoint.command.is_empty() {
                return Err(CatalogError::EmptyCommand {
                    path: path.to_path_buf(),
                });
            }
            self.commands.insert(command_key(&endpoint.command), endpoint);
        }
        Ok(())
    }

    /// The `GET /logs` index for a node of the given role.
    ///
    /// `own_port` is the port this daemon serves file and command artifacts
    /// on; HTTP endpoints carry their own port.
    #[must_use]
    pub fn endpoints_for_role(&self, role: Role, own_port: u16) -> BTreeMap<String, LogEndpoint> {
        let mut index = BTreeMap::new();

        for (key, endpoint) in &self.http {
            if !EndpointDescriptor::Http(endpoint.clone()).applies_to(role) {
                continue;
            }
            index.insert(
                key.clone(),
                LogEndpoint {
                    port_and_path: format!(":{}{}", endpoint.port, endpoint.uri),
                    optional: endpoint.optional,
                },
            );
        }

        for (key, endpoint) in &self.files {
            if !EndpointDescriptor::File(endpoint.clone()).applies_to(role) {
                continue;
            }
            index.insert(
                key.clone(),
                LogEndpoint {
                    port_and_path: format!(":{own_port}{BASE_ROUTE}/logs/files/{key}"),
                    optional: endpoint.optional,
                },
            );
        }

        for (key, endpoint) in &self.commands {
            if !EndpointDescriptor::Command(endpoint.clone()).applies_to(role) {
                continue;
            }
            index.insert(
                key.clone(),
                LogEndpoint {
                    port_and_path: format!(":{own_port}{BASE_ROUTE}/logs/cmds/{key}"),
                    optional: endpoint.optional,
                },
            );
        }

        index
    }

    /// Resolve a local `/logs/{provider}/{entity}` request for a node role.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when no such entity is configured,
    /// [`CatalogError::NotAllowed`] when it does not apply to `role`.
    pub fn resolve(
        &self,
        provider: LogProvider,
        entity: &str,
        role: Role,
    ) -> Result<EndpointDescriptor, CatalogError> {
        let descriptor = match provider {
            LogProvider::Units => self
                .http
                .get(entity)
                .cloned()
                .map(EndpointDescriptor::Http),
            LogProvider::Files => self
                .files
                .get(entity)
                .cloned()
                .map(EndpointDescriptor::File),
            LogProvider::Cmds => self
                .commands
                .get(entity)
                .cloned()
                .map(EndpointDescriptor::Command),
        };
        let descriptor = descriptor.ok_or_else(|| CatalogError::NotFound {
            entity: entity.to_string(),
        })?;
        if !descriptor.applies_to(role) {
            return Err(CatalogError::NotAllowed {
                entity: entity.to_string(),
            });
        }
        Ok(descriptor)
    }

    /// Number of configured endpoints across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.http.len() + self.files.len() + self.commands.len()
    }

    /// Whether the catalog has no endpoints at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File endpoints applying to `role`, with their sanitized keys.
    pub fn files_for_role(&self, role: Role) -> impl Iterator<Item = (&String, &FileEndpoint)> {
        self.files
            .iter()
            .filter(move |(_, e)| e.roles.is_empty() || e.roles.contains(&role))
    }

    /// Command endpoints applying to `role`, with their sanitized keys.
    pub fn commands_for_role(
        &self,
        role: Role,
    ) -> impl Iterator<Item = (&String, &CommandEndpoint)> {
        self.commands
            .iter()
            .filter(move |(_, e)| e.roles.is_empty() || e.roles.contains(&role))
    }
}

fn read_descriptor_file(path: &Path) -> Result<DescriptorFile, CatalogError> {
    let raw = std::fs::read(path).map_err(|err| CatalogError::Read {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_slice(&raw).map_err(|err| CatalogError::Parse {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
#[must_use]
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Catalog key for a file endpoint: leading slash trimmed, `/` → `_`.
fn file_key(location: &Path) -> String {
    location
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('/', "_")
}

/// Catalog key for a command endpoint: argv joined with `_`, `/` stripped.
fn command_key(command: &[String]) -> String {
    let joined = command.join("_").replace('/', "");
    format!("{joined}.output")
}

/// Catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A descriptor file could not be read.
    #[error("could not read endpoint config {}: {reason}", path.display())]
    Read {
        /// Path of the descriptor file.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// A descriptor file is not valid JSON.
    #[error("could not parse endpoint config {}: {reason}", path.display())]
    Parse {
        /// Path of the descriptor file.
        path: PathBuf,
        /// Human-readable cause.
        reason: String,
    },

    /// A command descriptor with an empty argv.
    #[error("empty command in endpoint config {}", path.display())]
    EmptyCommand {
        /// Path of the descriptor file.
        path: PathBuf,
    },

    /// No endpoint with the requested key.
    #[error("not found {entity}")]
    NotFound {
        /// Requested entity key.
        entity: String,
    },

    /// The endpoint does not apply to the local node role.
    #[error("{entity} is not available on this node role")]
    NotAllowed {
        /// Requested entity key.
        entity: String,
    },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{body}").unwrap();
        file
    }

    #[test]
    fn test_sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("/metrics/snapshot"), "_metrics_snapshot");
        assert_eq!(sanitize("a b:c"), "a_b_c");
        assert_eq!(sanitize("unit.service-5_x"), "unit.service-5_x");
    }

    #[test]
    fn test_http_key_defaults_to_port_and_sanitized_uri() {
        let file = write_config(r#"{"http": [{"port": 8080, "uri": "/metrics/snapshot"}]}"#);
        let catalog = EndpointCatalog::load(&[file.path().to_path_buf()]).unwrap();
        let index = catalog.endpoints_for_role(Role::Master, 1050);
        let entry = index.get("8080-_metrics_snapshot.json").unwrap();
        assert_eq!(entry.port_and_path, ":8080/metrics/snapshot");
        assert!(!entry.optional);
    }

    #[test]
    fn test_file_and_command_keys() {
        let file = write_config(
            r#"{
                "files": [{"location": "/var/log/scheduler/server.log"}],
                "commands": [{"command": ["/bin/ip", "addr"], "optional": true}]
            }"#,
        );
        let catalog = EndpointCatalog::load(&[file.path().to_path_buf()]).unwrap();
        let index = catalog.endpoints_for_role(Role::Agent, 61001);

        let file_entry = index.get("var_log_scheduler_server.log").unwrap();
        assert_eq!(
            file_entry.port_and_path,
            ":61001/system/health/v1/logs/files/var_log_scheduler_server.log"
        );

        let cmd_entry = index.get("binip_addr.output").unwrap();
        assert_eq!(
            cmd_entry.port_and_path,
            ":61001/system/health/v1/logs/cmds/binip_addr.output"
        );
        assert!(cmd_entry.optional);
    }

    #[test]
    fn test_later_config_overrides_earlier_by_key() {
        let first = write_config(r#"{"http": [{"port": 80, "uri": "/a", "file_name": "a.json"}]}"#);
        let second = write_config(
            r#"{"files": [{"location": "/var/log/shared.log", "optional": false}]}"#,
        );
        let third = write_config(
            r#"{"files": [{"location": "/var/log/shared.log", "optional": true}]}"#,
        );

        let catalog = EndpointCatalog::load(&[
            first.path().to_path_buf(),
            second.path().to_path_buf(),
            third.path().to_path_buf(),
        ])
        .unwrap();

        let index = catalog.endpoints_for_role(Role::Master, 1050);
        assert_eq!(index.len(), 2);
        // Last writer wins for the shared key.
        assert!(index.get("var_log_shared.log").unwrap().optional);
    }

    #[test]
    fn test_role_filter_empty_roles_match_everyone() {
        let file = write_config(
            r#"{
                "http": [
                    {"port": 1, "uri": "/any", "file_name": "any.json"},
                    {"port": 2, "uri": "/masters", "file_name": "masters.json", "roles": ["master"]}
                ]
            }"#,
        );
        let catalog = EndpointCatalog::load(&[file.path().to_path_buf()]).unwrap();

        let master_index = catalog.endpoints_for_role(Role::Master, 1050);
        assert_eq!(master_index.len(), 2);

        let agent_index = catalog.endpoints_for_role(Role::Agent, 61001);
        assert_eq!(agent_index.len(), 1);
        assert!(agent_index.contains_key("any.json"));
    }

    #[test]
    fn test_resolve_checks_role_and_existence() {
        let file = write_config(
            r#"{"files": [{"location": "/var/log/x.log", "roles": ["master"]}]}"#,
        );
        let catalog = EndpointCatalog::load(&[file.path().to_path_buf()]).unwrap();

        let ok = catalog.resolve(LogProvider::Files, "var_log_x.log", Role::Master);
        assert!(matches!(ok, Ok(EndpointDescriptor::File(_))));

        let denied = catalog.resolve(LogProvider::Files, "var_log_x.log", Role::Agent);
        assert!(matches!(denied, Err(CatalogError::NotAllowed { .. })));

        let missing = catalog.resolve(LogProvider::Files, "nope", Role::Master);
        assert!(matches!(missing, Err(CatalogError::NotFound { .. })));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let file = write_config(r#"{"commands": [{"command": []}]}"#);
        let err = EndpointCatalog::load(&[file.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, CatalogError::EmptyCommand { .. }));
    }

    #[test]
    fn test_log_endpoint_wire_names() {
        let entry = LogEndpoint {
            port_and_path: ":1050/x".to_string(),
            optional: true,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        assert_eq!(raw, r#"{"PortAndPath":":1050/x","Optional":true}"#);
    }
}
