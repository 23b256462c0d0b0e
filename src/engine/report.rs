//! Evaluation results

use crate::error::KilnError;
use crate::graph::OperationId;
use crate::service::{PortBinding, ServiceLease};
use crate::store::Artifact;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A running service as seen by dependents and callers
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub hostname: String,
    pub ports: Vec<PortBinding>,
    pub(crate) lease: Arc<ServiceLease>,
    /// Services this one binds, kept alive alongside it
    pub(crate) bound: Vec<ServiceEndpoint>,
}

impl ServiceEndpoint {
    /// Services reachable from this one by alias
    pub fn bound(&self) -> &[ServiceEndpoint] {
        &self.bound
    }
}

/// Value produced by one node
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Artifact(Artifact),
    Service(ServiceEndpoint),
}

impl NodeOutput {
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Artifact(artifact) => Some(artifact),
            Self::Service(_) => None,
        }
    }

    pub fn service(&self) -> Option<&ServiceEndpoint> {
        match self {
            Self::Service(endpoint) => Some(endpoint),
            Self::Artifact(_) => None,
        }
    }
}

/// An error attached to the node that produced it
///
/// Dependents share the same error; `origin` names the node it came from.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub error: Arc<KilnError>,
    pub origin: OperationId,
}

impl NodeFailure {
    pub fn new(origin: OperationId, error: KilnError) -> Self {
        Self {
            error: Arc::new(error),
            origin,
        }
    }

    pub fn shared(origin: OperationId, error: Arc<KilnError>) -> Self {
        Self { error, origin }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.error)
    }
}

pub type NodeResult = Result<NodeOutput, NodeFailure>;

/// Outcome for one requested root
#[derive(Debug, Clone)]
pub struct RootResult {
    pub root: OperationId,
    pub result: NodeResult,
}

/// Per-root results of one evaluation
#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    pub roots: Vec<RootResult>,
}

impl EvaluationReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&OperationId, &NodeOutput)> {
        self.roots
            .iter()
            .filter_map(|r| r.result.as_ref().ok().map(|out| (&r.root, out)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&OperationId, &NodeFailure)> {
        self.roots
            .iter()
            .filter_map(|r| r.result.as_ref().err().map(|f| (&r.root, f)))
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn get(&self, root: &OperationId) -> Option<&NodeResult> {
        self.roots.iter().find(|r| &r.root == root).map(|r| &r.result)
    }

    /// Serialisable summary for `--format json`
    pub fn summary(&self) -> Vec<RootSummary> {
        self.roots
            .iter()
            .map(|r| match &r.result {
                Ok(NodeOutput::Artifact(artifact)) => RootSummary {
                    root: r.root.to_string(),
                    status: "ok",
                    result: Some(artifact.address.to_string()),
                    error: None,
                    origin: None,
                },
                Ok(NodeOutput::Service(endpoint)) => RootSummary {
                    root: r.root.to_string(),
                    status: "ok",
                    result: Some(endpoint.hostname.clone()),
                    error: None,
                    origin: None,
                },
                Err(failure) => RootSummary {
                    root: r.root.to_string(),
                    status: "failed",
                    result: None,
                    error: Some(failure.error.to_string()),
                    origin: Some(failure.origin.to_string()),
                },
            })
            .collect()
    }
}

/// One line of the report
#[derive(Debug, Clone, Serialize)]
pub struct RootSummary {
    pub root: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ContentAddress;

    #[test]
    fn succeeded_and_failed_partition_roots() {
        let report = EvaluationReport {
            roots: vec![
                RootResult {
                    root: "ok".into(),
                    result: Ok(NodeOutput::Artifact(Artifact::dir(ContentAddress::of(b"x")))),
                },
                RootResult {
                    root: "bad".into(),
                    result: Err(NodeFailure::new(
                        "compile".into(),
                        KilnError::Execution {
                            kind: "exec".into(),
                            exit_code: 2,
                            output: "error: missing semicolon".into(),
                        },
                    )),
                },
            ],
        };

        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(report.failed().count(), 1);
        assert!(!report.is_success());

        let summary = report.summary();
        assert_eq!(summary[1].origin.as_deref(), Some("compile"));
        assert!(summary[1].error.as_ref().unwrap().contains("exec exited with code 2"));
        assert!(summary[1].error.as_ref().unwrap().contains("missing semicolon"));
    }
}
