//! Operation graphs
//!
//! A graph is a set of named operations. Edges point from an operation to
//! the operations it consumes. Only service-to-service hostname bindings may
//! form cycles; every other edge must be acyclic and is checked by
//! [`Graph::validate`] before anything runs.
//!
//! Graph documents are JSON or TOML:
//!
//! ```toml
//! roots = ["test"]
//!
//! [[operations]]
//! id = "base"
//! kind = "image"
//! reference = "docker.io/library/alpine:3.19"
//!
//! [[operations]]
//! id = "test"
//! kind = "exec"
//! rootfs = "base"
//! args = ["sh", "-c", "echo ok > /result"]
//! ```

mod builder;
mod plan;

pub use builder::GraphBuilder;
pub use plan::{GraphPlan, ServiceGroup};

use crate::error::{KilnError, KilnResult};
use crate::secrets::SecretRef;
use crate::service::{HealthCheck, PortMapping};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of an operation, unique within its graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(flatten)]
    pub kind: OpKind,
}

/// Every kind of operation the engine can run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    Image(ImageOp),
    Literal(LiteralOp),
    HostDirectory(HostDirectoryOp),
    WithDirectory(WithDirectoryOp),
    File(FileOp),
    Exec(ExecOp),
    Service(ServiceOp),
    Export(ExportOp),
    Breakpoint(BreakpointOp),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::Literal(_) => "literal",
            Self::HostDirectory(_) => "host_directory",
            Self::WithDirectory(_) => "with_directory",
            Self::File(_) => "file",
            Self::Exec(_) => "exec",
            Self::Service(_) => "service",
            Self::Export(_) => "export",
            Self::Breakpoint(_) => "breakpoint",
        }
    }

    /// Whether results may be served from the operation cache
    ///
    /// Sources read the host and exports write to it, so both always run.
    /// Services are deduplicated by the service manager instead.
    pub fn is_cacheable(&self) -> bool {
        !matches!(
            self,
            Self::Literal(_) | Self::HostDirectory(_) | Self::Export(_) | Self::Service(_)
        )
    }

    /// Operations whose results this one consumes, in parameter order
    ///
    /// Service-to-service bindings are excluded; see [`OpKind::service_bindings`].
    pub fn inputs(&self) -> Vec<&OperationId> {
        match self {
            Self::Image(_) | Self::Literal(_) | Self::HostDirectory(_) => Vec::new(),
            Self::WithDirectory(op) => vec![&op.base, &op.source],
            Self::File(op) => vec![&op.source],
            Self::Exec(op) => {
                let mut inputs = vec![&op.rootfs];
                inputs.extend(op.mounts.iter().map(|m| &m.source));
                inputs.extend(op.services.iter().map(|b| &b.service));
                inputs
            }
            Self::Service(op) => {
                let mut inputs = vec![&op.rootfs];
                inputs.extend(op.mounts.iter().map(|m| &m.source));
                inputs
            }
            Self::Export(op) => vec![&op.source],
            Self::Breakpoint(op) => vec![&op.source],
        }
    }

    /// Hostname bindings from a service to other services (may be cyclic)
    pub fn service_bindings(&self) -> &[ServiceBinding] {
        match self {
            Self::Service(op) => &op.services,
            _ => &[],
        }
    }

    /// Secrets this operation needs at sandbox construction time
    pub fn secrets(&self) -> &[SecretMount] {
        match self {
            Self::Exec(op) => &op.secrets,
            Self::Service(op) => &op.secrets,
            _ => &[],
        }
    }
}

/// Load a base filesystem from an image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOp {
    pub reference: String,
}

/// A single file with inline contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralOp {
    pub contents: String,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
}

fn default_file_mode() -> u32 {
    0o644
}

/// Explicit grant of a host directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDirectoryOp {
    pub path: PathBuf,
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// Place `source` at `path` inside `base`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithDirectoryOp {
    pub base: OperationId,
    pub path: String,
    pub source: OperationId,
}

/// Extract the entry at `path` from `source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub source: OperationId,
    pub path: String,
}

/// A tree mounted into a sandbox; mounts are inputs only and never part of
/// the resulting filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: OperationId,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Where a resolved secret appears inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretTarget {
    Env(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMount {
    pub reference: SecretRef,
    pub target: SecretTarget,
}

/// A service reachable from a sandbox under `alias`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub alias: String,
    pub service: OperationId,
}

/// Run a command on top of `rootfs`; the result is the resulting filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    pub rootfs: OperationId,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub secrets: Vec<SecretMount>,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    #[serde(default = "default_expect_exit")]
    pub expect_exit: Vec<i32>,
}

fn default_expect_exit() -> Vec<i32> {
    vec![0]
}

impl ExecOp {
    pub fn new(rootfs: impl Into<OperationId>, args: &[&str]) -> Self {
        Self {
            rootfs: rootfs.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            workdir: None,
            user: None,
            mounts: Vec::new(),
            secrets: Vec::new(),
            services: Vec::new(),
            expect_exit: default_expect_exit(),
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn mount(mut self, source: impl Into<OperationId>, target: &str, readonly: bool) -> Self {
        self.mounts.push(Mount {
            source: source.into(),
            target: target.to_string(),
            readonly,
        });
        self
    }

    pub fn secret(mut self, reference: SecretRef, target: SecretTarget) -> Self {
        self.secrets.push(SecretMount { reference, target });
        self
    }

    pub fn bind(mut self, alias: &str, service: impl Into<OperationId>) -> Self {
        self.services.push(ServiceBinding {
            alias: alias.to_string(),
            service: service.into(),
        });
        self
    }
}

/// A port to publish on the host once the service is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    #[serde(default)]
    pub mapping: PortMapping,
}

/// Start a long-lived service on top of `rootfs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOp {
    pub rootfs: OperationId,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub health: HealthCheck,
    /// Overrides `services.health_max_attempts` for this service
    #[serde(default)]
    pub health_attempts: Option<u32>,
    #[serde(default)]
    pub secrets: Vec<SecretMount>,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    #[serde(default)]
    pub expose: Vec<ExposedPort>,
}

impl ServiceOp {
    pub fn new(rootfs: impl Into<OperationId>, args: &[&str]) -> Self {
        Self {
            rootfs: rootfs.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            workdir: None,
            mounts: Vec::new(),
            ports: Vec::new(),
            health: HealthCheck::None,
            health_attempts: None,
            secrets: Vec::new(),
            services: Vec::new(),
            expose: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn health(mut self, health: HealthCheck) -> Self {
        self.health = health;
        self
    }

    pub fn bind(mut self, alias: &str, service: impl Into<OperationId>) -> Self {
        self.services.push(ServiceBinding {
            alias: alias.to_string(),
            service: service.into(),
        });
        self
    }

    pub fn secret(mut self, reference: SecretRef, target: SecretTarget) -> Self {
        self.secrets.push(SecretMount { reference, target });
        self
    }
}

/// Write `source` to a host path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOp {
    pub source: OperationId,
    pub path: PathBuf,
}

/// Pause for inspection of `source` before dependents run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointOp {
    pub source: OperationId,
    #[serde(default)]
    pub label: Option<String>,
}

/// A submitted operation graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub roots: Vec<OperationId>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Graph {
    /// Load a graph document, choosing the format by file extension
    pub fn load(path: &Path) -> KilnResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KilnError::io(format!("reading graph {}", path.display()), e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Err(KilnError::PathInvalid {
                path: path.to_path_buf(),
                reason: "graph documents must be .json or .toml".to_string(),
            }),
        }
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.id == id)
    }

    /// Check the graph and compute its execution plan
    pub fn validate(&self) -> KilnResult<GraphPlan> {
        plan::build(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
roots = ["build"]

[[operations]]
id = "base"
kind = "image"
reference = "alpine:3.19"

[[operations]]
id = "build"
kind = "exec"
rootfs = "base"
args = ["make"]

[operations.env]
CC = "clang"

[[operations.secrets]]
reference = "env://NPM_TOKEN"
target = { env = "NPM_TOKEN" }
"#;

    #[test]
    fn parse_toml_document() {
        let graph: Graph = toml::from_str(DOC).unwrap();
        assert_eq!(graph.roots, vec![OperationId::from("build")]);
        let build = graph.get(&"build".into()).unwrap();
        match &build.kind {
            OpKind::Exec(op) => {
                assert_eq!(op.expect_exit, vec![0]);
                assert_eq!(op.env.get("CC").map(String::as_str), Some("clang"));
                assert_eq!(op.secrets[0].target, SecretTarget::Env("NPM_TOKEN".into()));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn json_tagging() {
        let op = Operation {
            id: "src".into(),
            kind: OpKind::Literal(LiteralOp {
                contents: "hi".into(),
                mode: 0o644,
            }),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "literal");
        assert_eq!(json["id"], "src");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn inputs_exclude_service_bindings_between_services() {
        let svc = OpKind::Service(ServiceOp::new("base", &["server"]).bind("peer", "other"));
        assert_eq!(svc.inputs(), vec![&OperationId::from("base")]);
        assert_eq!(svc.service_bindings().len(), 1);

        let exec = OpKind::Exec(ExecOp::new("base", &["curl", "db"]).bind("db", "pg"));
        assert_eq!(
            exec.inputs(),
            vec![&OperationId::from("base"), &OperationId::from("pg")]
        );
    }

    #[test]
    fn cacheability() {
        assert!(OpKind::Exec(ExecOp::new("b", &["true"])).is_cacheable());
        assert!(!OpKind::Literal(LiteralOp {
            contents: String::new(),
            mode: 0o644
        })
        .is_cacheable());
        assert!(!OpKind::Export(ExportOp {
            source: "x".into(),
            path: "/tmp/x".into()
        })
        .is_cacheable());
    }
}
