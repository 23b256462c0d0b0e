//! Programmatic graph construction

use crate::graph::{
    BreakpointOp, ExecOp, ExportOp, FileOp, Graph, HostDirectoryOp, ImageOp, LiteralOp, OpKind,
    Operation, OperationId, ServiceOp, WithDirectoryOp,
};
use std::path::PathBuf;

/// Fluent builder for [`Graph`]
///
/// Nothing is checked until [`Graph::validate`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, id: &str, kind: OpKind) -> Self {
        self.graph.operations.push(Operation {
            id: OperationId::new(id),
            kind,
        });
        self
    }

    pub fn root(mut self, id: &str) -> Self {
        self.graph.roots.push(OperationId::new(id));
        self
    }

    pub fn image(self, id: &str, reference: &str) -> Self {
        self.op(
            id,
            OpKind::Image(ImageOp {
                reference: reference.to_string(),
            }),
        )
    }

    pub fn literal(self, id: &str, contents: &str) -> Self {
        self.op(
            id,
            OpKind::Literal(LiteralOp {
                contents: contents.to_string(),
                mode: 0o644,
            }),
        )
    }

    pub fn host_directory(self, id: &str, path: impl Into<PathBuf>, excludes: &[&str]) -> Self {
        self.op(
            id,
            OpKind::HostDirectory(HostDirectoryOp {
                path: path.into(),
                excludes: excludes.iter().map(|e| e.to_string()).collect(),
            }),
        )
    }

    pub fn with_directory(self, id: &str, base: &str, path: &str, source: &str) -> Self {
        self.op(
            id,
            OpKind::WithDirectory(WithDirectoryOp {
                base: base.into(),
                path: path.to_string(),
                source: source.into(),
            }),
        )
    }

    pub fn file(self, id: &str, source: &str, path: &str) -> Self {
        self.op(
            id,
            OpKind::File(FileOp {
                source: source.into(),
                path: path.to_string(),
            }),
        )
    }

    pub fn exec(self, id: &str, exec: ExecOp) -> Self {
        self.op(id, OpKind::Exec(exec))
    }

    pub fn service(self, id: &str, service: ServiceOp) -> Self {
        self.op(id, OpKind::Service(service))
    }

    pub fn export(self, id: &str, source: &str, path: impl Into<PathBuf>) -> Self {
        self.op(
            id,
            OpKind::Export(ExportOp {
                source: source.into(),
                path: path.into(),
            }),
        )
    }

    pub fn breakpoint(self, id: &str, source: &str) -> Self {
        self.op(
            id,
            OpKind::Breakpoint(BreakpointOp {
                source: source.into(),
                label: None,
            }),
        )
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}
