//! Insert ordering.
//!
//! Foreign-key producers must be written before their consumers. Every edge
//! that carries a key makes one of its endpoints wait on the other; nodes are
//! then released level by level.

use crate::errors::UpsertGraphError;
use crate::graph::{Edge, EdgeId, EdgeKind, ModelGraph, NodeId, NodeKind};
use crate::model::RelationKind;

/// The endpoint of `edge` that must wait for the other one, if any.
///
/// Has-many children hold the owner's key, belongs-to-one owners hold the
/// related key and property references are filled from their related side.
/// Join rows are written after every batch, so many-to-many edges impose no
/// order.
pub(crate) fn dependent_node(edge: &Edge) -> Option<NodeId> {
    match edge.kind() {
        EdgeKind::Relation(relation) => match relation.kind {
            RelationKind::HasMany => Some(edge.related_node()),
            RelationKind::BelongsToOne => Some(edge.owner_node()),
            RelationKind::ManyToMany(_) => None,
        },
        EdgeKind::Reference(_) => Some(edge.owner_node()),
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DependencyMap {
    dependencies: Vec<Vec<EdgeId>>,
    dependents: Vec<Vec<EdgeId>>,
}

impl DependencyMap {
    pub(crate) fn build(graph: &ModelGraph) -> Self {
        let mut dependencies = vec![Vec::new(); graph.len()];
        let mut dependents = vec![Vec::new(); graph.len()];
        for (index, edge) in graph.edges().iter().enumerate() {
            if let Some(node) = dependent_node(edge) {
                let id = EdgeId(index);
                dependencies[node.index()].push(id);
                dependents[edge.other_node(node).index()].push(id);
            }
        }
        Self {
            dependencies,
            dependents,
        }
    }

    /// Edges `node` waits on.
    pub(crate) fn dependencies(&self, node: NodeId) -> &[EdgeId] {
        &self.dependencies[node.index()]
    }

    /// Edges waiting on `node`.
    pub(crate) fn dependents(&self, node: NodeId) -> &[EdgeId] {
        &self.dependents[node.index()]
    }
}

/// Splits the graph into insert batches. Every node of a batch depends only
/// on nodes of earlier batches.
///
/// Relation-reference placeholders never form a batch of their own: they are
/// released together with the node they stand for.
pub(crate) fn schedule(
    graph: &ModelGraph,
    deps: &DependencyMap,
) -> Result<Vec<Vec<NodeId>>, UpsertGraphError> {
    let mut handled = vec![false; graph.len()];
    let mut remaining = graph.len();
    let mut batches = Vec::new();

    while remaining > 0 {
        let ready: Vec<NodeId> = graph
            .node_ids()
            .filter(|&id| {
                !handled[id.index()]
                    && !matches!(graph.node(id).kind(), NodeKind::RelationReference { .. })
                    && deps
                        .dependencies(id)
                        .iter()
                        .all(|&edge| handled[graph.edge(edge).other_node(id).index()])
            })
            .collect();

        if ready.is_empty() {
            let stuck: Vec<String> = graph
                .node_ids()
                .filter(|id| !handled[id.index()])
                .map(|id| describe_path(graph.node(id).data_path()))
                .collect();
            return Err(UpsertGraphError::dependency_cycle(format!(
                "no insert order exists for {}",
                stuck.join(", ")
            )));
        }

        for &id in &ready {
            remaining -= mark_handled(graph, id, &mut handled);
        }
        batches.push(ready);
    }

    Ok(batches)
}

/// Marks `node` and, transitively, its placeholders. Returns how many nodes
/// became handled.
fn mark_handled(graph: &ModelGraph, node: NodeId, handled: &mut [bool]) -> usize {
    let mut count = 0;
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        if handled[id.index()] {
            continue;
        }
        handled[id.index()] = true;
        count += 1;
        stack.extend_from_slice(graph.node(id).referencing_nodes());
    }
    count
}

pub(crate) fn describe_path(data_path: &str) -> String {
    if data_path.is_empty() {
        "<root>".to_string()
    } else {
        data_path.to_string()
    }
}
