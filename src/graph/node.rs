use std::fmt;
use std::sync::Arc;

use crate::model::{Entity, EntityType};

use super::edge::EdgeId;

/// Index of a node inside its graph's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a node stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular entity: inserted, patched or left alone by policy.
    Entity,
    /// Placeholder for another node of the same graph. It is related to its
    /// parent once the target has its keys; it is never inserted itself.
    RelationReference { target: NodeId },
    /// An existing storage row supplied by id, only related.
    ExternalReference,
}

/// Bookkeeping written while the graph is reconciled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub inserted: bool,
    pub updated: bool,
}

/// One entity positioned within a graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) entity_type: Arc<EntityType>,
    pub(crate) entity: Entity,
    pub(crate) relation_path: String,
    pub(crate) data_path: String,
    pub(crate) parent_node: Option<NodeId>,
    pub(crate) parent_edge: Option<EdgeId>,
    pub(crate) edges: Vec<EdgeId>,
    pub(crate) referencing_nodes: Vec<NodeId>,
    pub(crate) flags: NodeFlags,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self.kind, NodeKind::Entity)
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut Entity {
        &mut self.entity
    }

    /// Dotted relation names from the root, `""` for roots.
    pub fn relation_path(&self) -> &str {
        &self.relation_path
    }

    /// Position in the caller's input, used in error messages.
    pub fn data_path(&self) -> &str {
        &self.data_path
    }

    pub fn parent_node(&self) -> Option<NodeId> {
        self.parent_node
    }

    pub fn parent_edge(&self) -> Option<EdgeId> {
        self.parent_edge
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    /// Placeholder nodes whose identity is this node.
    pub fn referencing_nodes(&self) -> &[NodeId] {
        &self.referencing_nodes
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn has_id(&self) -> bool {
        self.entity.has_id(&self.entity_type.id_props)
    }

    pub(crate) fn describe_id(&self) -> String {
        self.entity
            .id_key(&self.entity_type.id_props)
            .map_or_else(|| "undefined".to_string(), |key| key.to_string())
    }
}
