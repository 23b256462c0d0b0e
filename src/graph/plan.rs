//! Graph validation and execution planning

use crate::error::{KilnError, KilnResult};
use crate::graph::{Graph, OpKind, OperationId};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Services that reference each other's hostnames and must start together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGroup {
    /// Members sorted by id
    pub members: Vec<OperationId>,
}

/// Validated graph with a dependency-respecting order
#[derive(Debug, Clone)]
pub struct GraphPlan {
    /// Every operation, dependencies before dependents
    pub order: Vec<OperationId>,
    /// Strongly connected components of the service binding graph, bound
    /// groups before the groups that bind them
    pub service_groups: Vec<ServiceGroup>,
    group_of: HashMap<OperationId, usize>,
}

impl GraphPlan {
    /// Index into `service_groups` for a service operation
    pub fn group_of(&self, id: &OperationId) -> Option<usize> {
        self.group_of.get(id).copied()
    }

    pub fn group(&self, id: &OperationId) -> Option<&ServiceGroup> {
        self.group_of(id).map(|i| &self.service_groups[i])
    }
}

pub(super) fn build(graph: &Graph) -> KilnResult<GraphPlan> {
    let mut index: HashMap<&OperationId, usize> = HashMap::new();
    for (i, op) in graph.operations.iter().enumerate() {
        if index.insert(&op.id, i).is_some() {
            return Err(KilnError::InvalidGraph(format!(
                "operation '{}' is defined more than once",
                op.id
            )));
        }
    }

    for root in &graph.roots {
        if !index.contains_key(root) {
            return Err(KilnError::UnknownOperation(root.to_string()));
        }
    }

    // Dependency edges: dependency -> dependent
    let mut deps = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..graph.operations.len())
        .map(|i| deps.add_node(i))
        .collect();

    // Service binding edges: binder -> bound
    let mut bindings = DiGraph::<usize, ()>::new();
    let mut service_nodes: HashMap<usize, NodeIndex> = HashMap::new();

    for (i, op) in graph.operations.iter().enumerate() {
        check_operation(graph, &index, i)?;
        for input in op.kind.inputs() {
            let j = index[input];
            deps.add_edge(nodes[j], nodes[i], ());
        }
        if let OpKind::Service(_) = op.kind {
            service_nodes.insert(i, bindings.add_node(i));
        }
    }

    let sorted = toposort(&deps, None).map_err(|cycle| KilnError::Cycle {
        cycle: cycle_path(&deps, cycle.node_id())
            .into_iter()
            .map(|n| graph.operations[deps[n]].id.to_string())
            .collect(),
    })?;

    for (i, op) in graph.operations.iter().enumerate() {
        for binding in op.kind.service_bindings() {
            let j = index[&binding.service];
            bindings.add_edge(service_nodes[&i], service_nodes[&j], ());
        }
    }

    // tarjan_scc yields components in reverse topological order, so bound
    // services come before their binders
    let mut service_groups = Vec::new();
    let mut group_of = HashMap::new();
    for component in tarjan_scc(&bindings) {
        let mut members: Vec<OperationId> = component
            .iter()
            .map(|n| graph.operations[bindings[*n]].id.clone())
            .collect();
        members.sort();
        for member in &members {
            group_of.insert(member.clone(), service_groups.len());
        }
        service_groups.push(ServiceGroup { members });
    }

    Ok(GraphPlan {
        order: sorted
            .into_iter()
            .map(|n| graph.operations[deps[n]].id.clone())
            .collect(),
        service_groups,
        group_of,
    })
}

fn check_operation(
    graph: &Graph,
    index: &HashMap<&OperationId, usize>,
    i: usize,
) -> KilnResult<()> {
    let op = &graph.operations[i];
    let lookup = |id: &OperationId| {
        index
            .get(id)
            .map(|j| &graph.operations[*j])
            .ok_or_else(|| {
                KilnError::UnknownOperation(format!("{} (referenced by '{}')", id, op.id))
            })
    };

    let binding_targets: Vec<&OperationId> = match &op.kind {
        OpKind::Exec(exec) => exec.services.iter().map(|b| &b.service).collect(),
        OpKind::Service(svc) => svc.services.iter().map(|b| &b.service).collect(),
        _ => Vec::new(),
    };

    for input in op.kind.inputs() {
        let target = lookup(input)?;
        let is_binding = binding_targets.contains(&input);
        if matches!(target.kind, OpKind::Service(_)) && !is_binding {
            return Err(KilnError::InvalidGraph(format!(
                "'{}' uses service '{}' as a filesystem; services can only be bound",
                op.id, input
            )));
        }
    }

    for target in &binding_targets {
        if !matches!(lookup(target)?.kind, OpKind::Service(_)) {
            return Err(KilnError::InvalidGraph(format!(
                "'{}' binds '{}', which is not a service",
                op.id, target
            )));
        }
    }

    let mut aliases = HashSet::new();
    let bindings = match &op.kind {
        OpKind::Exec(exec) => exec.services.as_slice(),
        OpKind::Service(svc) => svc.services.as_slice(),
        _ => &[],
    };
    for binding in bindings {
        if !is_valid_alias(&binding.alias) {
            return Err(KilnError::InvalidGraph(format!(
                "'{}': '{}' is not a valid hostname alias",
                op.id, binding.alias
            )));
        }
        if !aliases.insert(binding.alias.as_str()) {
            return Err(KilnError::InvalidGraph(format!(
                "'{}' binds alias '{}' twice",
                op.id, binding.alias
            )));
        }
    }

    match &op.kind {
        OpKind::Exec(exec) if exec.args.is_empty() => Err(KilnError::InvalidGraph(format!(
            "exec '{}' has no command",
            op.id
        ))),
        OpKind::Service(svc) if svc.args.is_empty() => Err(KilnError::InvalidGraph(format!(
            "service '{}' has no command",
            op.id
        ))),
        OpKind::Service(svc) => {
            for exposed in &svc.expose {
                if !svc.ports.contains(&exposed.port) {
                    return Err(KilnError::InvalidGraph(format!(
                        "service '{}' exposes undeclared port {}",
                        op.id, exposed.port
                    )));
                }
            }
            Ok(())
        }
        OpKind::Exec(exec) if exec.expect_exit.is_empty() => Err(KilnError::InvalidGraph(
            format!("exec '{}' accepts no exit codes", op.id),
        )),
        _ => Ok(()),
    }
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= 63
        && !alias.starts_with('-')
        && !alias.ends_with('-')
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Shortest cycle through `start`, as `[start, .., start]`
fn cycle_path(graph: &DiGraph<usize, ()>, start: NodeIndex) -> Vec<NodeIndex> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for next in graph.neighbors(node) {
            if next == start {
                let mut tail = vec![node];
                let mut cur = node;
                while let Some(p) = parent.get(&cur) {
                    if *p == start {
                        break;
                    }
                    tail.push(*p);
                    cur = *p;
                }
                if node == start {
                    return vec![start, start];
                }
                let mut path = vec![start];
                path.extend(tail.into_iter().rev());
                path.push(start);
                return path;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = parent.entry(next) {
                slot.insert(node);
                queue.push_back(next);
            }
        }
    }
    vec![start]
}

#[cfg(test)]
mod tests {
    use crate::error::KilnError;
    use crate::graph::{ExecOp, GraphBuilder, ServiceOp};

    #[test]
    fn diamond_orders_dependencies_first() {
        let graph = GraphBuilder::new()
            .image("a", "alpine")
            .exec("b", ExecOp::new("a", &["echo", "b"]))
            .exec("c", ExecOp::new("a", &["echo", "c"]))
            .exec("d", ExecOp::new("b", &["echo", "d"]).mount("c", "/c", true))
            .root("d")
            .build();

        let plan = graph.validate().unwrap();
        let pos = |id: &str| plan.order.iter().position(|o| o.as_str() == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let graph = GraphBuilder::new()
            .exec("x", ExecOp::new("y", &["true"]))
            .exec("y", ExecOp::new("x", &["true"]))
            .build();

        match graph.validate() {
            Err(KilnError::Cycle { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"x".to_string()));
                assert!(cycle.contains(&"y".to_string()));
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn mutual_services_form_one_group() {
        let graph = GraphBuilder::new()
            .image("base", "alpine")
            .service("svc-a", ServiceOp::new("base", &["a"]).bind("b", "svc-b"))
            .service("svc-b", ServiceOp::new("base", &["b"]).bind("a", "svc-a"))
            .service("svc-c", ServiceOp::new("base", &["c"]))
            .service("front", ServiceOp::new("base", &["f"]).bind("c", "svc-c"))
            .build();

        let plan = graph.validate().unwrap();
        let ab = plan.group(&"svc-a".into()).unwrap();
        assert_eq!(ab.members.len(), 2);
        assert_eq!(plan.group_of(&"svc-a".into()), plan.group_of(&"svc-b".into()));

        // Bound service groups precede their binders
        assert!(plan.group_of(&"svc-c".into()) < plan.group_of(&"front".into()));
    }

    #[test]
    fn unknown_reference() {
        let graph = GraphBuilder::new()
            .exec("x", ExecOp::new("missing", &["true"]))
            .build();
        assert!(matches!(
            graph.validate(),
            Err(KilnError::UnknownOperation(_))
        ));
    }

    #[test]
    fn duplicate_ids() {
        let graph = GraphBuilder::new()
            .image("a", "alpine")
            .image("a", "debian")
            .build();
        assert!(matches!(graph.validate(), Err(KilnError::InvalidGraph(_))));
    }

    #[test]
    fn service_cannot_be_used_as_filesystem() {
        let graph = GraphBuilder::new()
            .image("base", "alpine")
            .service("db", ServiceOp::new("base", &["postgres"]))
            .exec("x", ExecOp::new("db", &["true"]))
            .build();
        assert!(matches!(graph.validate(), Err(KilnError::InvalidGraph(_))));
    }

    #[test]
    fn exec_binding_must_target_service() {
        let graph = GraphBuilder::new()
            .image("base", "alpine")
            .exec("x", ExecOp::new("base", &["true"]).bind("db", "base"))
            .build();
        assert!(matches!(graph.validate(), Err(KilnError::InvalidGraph(_))));
    }

    #[test]
    fn bad_alias() {
        let graph = GraphBuilder::new()
            .image("base", "alpine")
            .service("db", ServiceOp::new("base", &["postgres"]))
            .exec("x", ExecOp::new("base", &["true"]).bind("not valid", "db"))
            .build();
        assert!(matches!(graph.validate(), Err(KilnError::InvalidGraph(_))));
    }

    #[test]
    fn unknown_root() {
        let graph = GraphBuilder::new().image("a", "alpine").root("zzz").build();
        assert!(matches!(
            graph.validate(),
            Err(KilnError::UnknownOperation(_))
        ));
    }
}
