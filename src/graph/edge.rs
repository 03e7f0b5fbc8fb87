use std::sync::Arc;

use crate::model::Relation;

use super::node::NodeId;

/// Index of an edge inside its graph's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) usize);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Same-graph property pointer: the owner's value at `owner_path` is filled
/// from the related node's value at `related_path` wherever `token` appears.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyReference {
    pub owner_path: Vec<String>,
    pub related_path: Vec<String>,
    pub token: String,
}

#[derive(Clone, Debug)]
pub enum EdgeKind {
    Relation(Arc<Relation>),
    Reference(PropertyReference),
}

/// Undirected pair with an owner/related distinction.
#[derive(Clone, Debug)]
pub struct Edge {
    pub(crate) owner: NodeId,
    pub(crate) related: NodeId,
    pub(crate) kind: EdgeKind,
}

impl Edge {
    pub fn owner_node(&self) -> NodeId {
        self.owner
    }

    pub fn related_node(&self) -> NodeId {
        self.related
    }

    pub fn kind(&self) -> &EdgeKind {
        &self.kind
    }

    pub fn is_owner_node(&self, node: NodeId) -> bool {
        self.owner == node
    }

    pub fn other_node(&self, node: NodeId) -> NodeId {
        if self.owner == node {
            self.related
        } else {
            self.owner
        }
    }

    pub fn relation(&self) -> Option<&Arc<Relation>> {
        match &self.kind {
            EdgeKind::Relation(relation) => Some(relation),
            EdgeKind::Reference(_) => None,
        }
    }
}
