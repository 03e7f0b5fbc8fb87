use super::model_graph::ModelGraph;
use super::node::NodeId;

/// The desired graph next to the current graph fetched from storage.
///
/// Current-to-desired counterparts and the per-current-node "an ancestor is
/// being removed" flag are computed once, in a single top-down pass, before
/// any decision runs. Desired-to-current lookups stay dynamic because
/// desired entities gain identifiers while inserts run.
#[derive(Clone, Debug)]
pub struct GraphPair {
    pub(crate) desired: ModelGraph,
    pub(crate) current: ModelGraph,
    current_to_desired: Vec<Option<NodeId>>,
    ancestor_removed: Vec<bool>,
}

impl GraphPair {
    pub fn new(desired: ModelGraph, current: ModelGraph) -> Self {
        let current_to_desired: Vec<Option<NodeId>> = current
            .nodes()
            .iter()
            .map(|node| desired.node_for_node(node))
            .collect();

        // Parents precede children in the arena, so one forward pass suffices.
        let mut ancestor_removed = vec![false; current.len()];
        for node in current.nodes() {
            if let Some(parent) = node.parent_node() {
                ancestor_removed[node.id().index()] = current_to_desired[parent.index()]
                    .is_none()
                    || ancestor_removed[parent.index()];
            }
        }

        Self {
            desired,
            current,
            current_to_desired,
            ancestor_removed,
        }
    }

    pub fn desired(&self) -> &ModelGraph {
        &self.desired
    }

    pub fn current(&self) -> &ModelGraph {
        &self.current
    }

    pub fn into_desired(self) -> ModelGraph {
        self.desired
    }

    /// Current-graph counterpart of a desired node.
    pub fn current_of(&self, desired: NodeId) -> Option<NodeId> {
        self.current.node_for_node(self.desired.node(desired))
    }

    /// Desired-graph counterpart of a current node.
    pub fn desired_of(&self, current: NodeId) -> Option<NodeId> {
        self.current_to_desired[current.index()]
    }

    /// Whether some ancestor of a current node is absent from the desired graph.
    pub fn ancestor_removed(&self, current: NodeId) -> bool {
        self.ancestor_removed[current.index()]
    }
}
