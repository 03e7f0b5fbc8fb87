//! Arena-backed entity graph.
//!
//! Nodes and edges live in vectors and refer to each other by index, so
//! parent pointers, reference back-links and dependency tables never form
//! ownership cycles. Parents are always allocated before their children,
//! which keeps every parent chain acyclic by construction.

use std::sync::Arc;

use ahash::AHashMap;

use crate::errors::UpsertGraphError;
use crate::model::{Entity, EntityType, Relation, RelationKind, parse_path};

use super::edge::{Edge, EdgeId, EdgeKind, PropertyReference};
use super::node::{Node, NodeFlags, NodeId, NodeKind};

/// Shape of the caller's input, mirrored by the reconciliation result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputShape {
    One,
    Many,
}

#[derive(Clone, Debug)]
pub struct ModelGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    roots: Vec<NodeId>,
    shape: InputShape,
    identity: AHashMap<(String, String), NodeId>,
}

impl ModelGraph {
    pub fn new(shape: InputShape) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            roots: Vec::new(),
            shape,
            identity: AHashMap::new(),
        }
    }

    /// Graph built from a single root object.
    pub fn single() -> Self {
        Self::new(InputShape::One)
    }

    /// Graph built from an array of root objects.
    pub fn many() -> Self {
        Self::new(InputShape::Many)
    }

    pub fn shape(&self) -> InputShape {
        self.shape
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_root(&mut self, entity_type: Arc<EntityType>, entity: Entity) -> NodeId {
        let data_path = match self.shape {
            InputShape::One => String::new(),
            InputShape::Many => format!("[{}]", self.roots.len()),
        };
        let id = self.push_node(NodeKind::Entity, entity_type, entity, String::new(), data_path);
        self.roots.push(id);
        id
    }

    /// Adds `entity` as a child of `parent` through `relation`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        relation: Arc<Relation>,
        entity_type: Arc<EntityType>,
        entity: Entity,
    ) -> Result<NodeId, UpsertGraphError> {
        self.attach(parent, relation, NodeKind::Entity, entity_type, entity)
    }

    /// Adds an existing storage row, identified by the id on `entity`, as a
    /// child of `parent`. It will be related, never inserted.
    pub fn add_external_reference(
        &mut self,
        parent: NodeId,
        relation: Arc<Relation>,
        entity_type: Arc<EntityType>,
        entity: Entity,
    ) -> Result<NodeId, UpsertGraphError> {
        if !entity.has_id(&entity_type.id_props) {
            return Err(UpsertGraphError::configuration(format!(
                "external reference to {} must carry an id",
                entity_type.name
            )));
        }
        self.attach(
            parent,
            relation,
            NodeKind::ExternalReference,
            entity_type,
            entity,
        )
    }

    /// Adds a placeholder under `parent` standing for `target`, another node
    /// of this graph. The placeholder receives the target's keys once the
    /// target is inserted.
    pub fn add_relation_reference(
        &mut self,
        parent: NodeId,
        relation: Arc<Relation>,
        target: NodeId,
    ) -> Result<NodeId, UpsertGraphError> {
        self.check_node(target)?;
        let entity_type = Arc::clone(&self.nodes[target.0].entity_type);
        let id = self.attach(
            parent,
            relation,
            NodeKind::RelationReference { target },
            entity_type,
            Entity::new(),
        )?;
        self.nodes[target.0].referencing_nodes.push(id);
        Ok(id)
    }

    /// Declares that `owner`'s value at `owner_path` (dotted) must be filled
    /// from `related`'s value at `related_path` wherever `token` appears.
    pub fn add_property_reference(
        &mut self,
        owner: NodeId,
        owner_path: &str,
        related: NodeId,
        related_path: &str,
        token: &str,
    ) -> Result<EdgeId, UpsertGraphError> {
        self.check_node(owner)?;
        self.check_node(related)?;
        let reference = PropertyReference {
            owner_path: parse_path(owner_path),
            related_path: parse_path(related_path),
            token: token.to_string(),
        };
        if reference.owner_path.is_empty() || reference.related_path.is_empty() {
            return Err(UpsertGraphError::configuration(
                "property reference paths must not be empty",
            ));
        }
        if token.is_empty() {
            return Err(UpsertGraphError::configuration(
                "property reference token must not be empty",
            ));
        }
        Ok(self.push_edge(owner, related, EdgeKind::Reference(reference)))
    }

    /// Counterpart of `other` (a node of another graph) in this graph, matched
    /// by entity type and identifier.
    pub fn node_for_node(&self, other: &Node) -> Option<NodeId> {
        let key = other.entity.id_key(&other.entity_type.id_props)?;
        self.identity
            .get(&(other.entity_type.name.clone(), key.index_key()))
            .copied()
    }

    /// Chain of ancestors from the direct parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.nodes[id.0].parent_node, move |current| {
            self.nodes[current.0].parent_node
        })
    }

    fn check_node(&self, id: NodeId) -> Result<(), UpsertGraphError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(UpsertGraphError::configuration(format!(
                "node {id} does not belong to this graph"
            )))
        }
    }

    fn attach(
        &mut self,
        parent: NodeId,
        relation: Arc<Relation>,
        kind: NodeKind,
        entity_type: Arc<EntityType>,
        entity: Entity,
    ) -> Result<NodeId, UpsertGraphError> {
        self.check_node(parent)?;
        let parent_node = &self.nodes[parent.0];
        if parent_node.entity_type.name != relation.owner_type {
            return Err(UpsertGraphError::configuration(format!(
                "relation {} is owned by {}, not {}",
                relation.name, relation.owner_type, parent_node.entity_type.name
            )));
        }
        if entity_type.name != relation.related_type {
            return Err(UpsertGraphError::configuration(format!(
                "relation {} relates {}, not {}",
                relation.name, relation.related_type, entity_type.name
            )));
        }

        let relation_path = if parent_node.relation_path.is_empty() {
            relation.name.clone()
        } else {
            format!("{}.{}", parent_node.relation_path, relation.name)
        };
        let segment = match relation.kind {
            RelationKind::BelongsToOne => relation.name.clone(),
            RelationKind::HasMany | RelationKind::ManyToMany(_) => {
                let siblings = self.children_via(parent, &relation.name);
                format!("{}[{}]", relation.name, siblings)
            }
        };
        let data_path = if parent_node.data_path.is_empty() {
            segment
        } else {
            format!("{}.{}", parent_node.data_path, segment)
        };

        let id = self.push_node(kind, entity_type, entity, relation_path, data_path);
        let edge = self.push_edge(parent, id, EdgeKind::Relation(relation));
        let node = &mut self.nodes[id.0];
        node.parent_node = Some(parent);
        node.parent_edge = Some(edge);
        Ok(id)
    }

    fn children_via(&self, parent: NodeId, relation: &str) -> usize {
        self.nodes[parent.0]
            .edges
            .iter()
            .map(|edge| &self.edges[edge.0])
            .filter(|edge| {
                edge.owner == parent && edge.relation().is_some_and(|rel| rel.name == relation)
            })
            .count()
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        entity_type: Arc<EntityType>,
        entity: Entity,
        relation_path: String,
        data_path: String,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(key) = entity.id_key(&entity_type.id_props) {
            self.identity
                .entry((entity_type.name.clone(), key.index_key()))
                .or_insert(id);
        }
        self.nodes.push(Node {
            id,
            kind,
            entity_type,
            entity,
            relation_path,
            data_path,
            parent_node: None,
            parent_edge: None,
            edges: Vec::new(),
            referencing_nodes: Vec::new(),
            flags: NodeFlags::default(),
        });
        id
    }

    fn push_edge(&mut self, owner: NodeId, related: NodeId, kind: EdgeKind) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Edge {
            owner,
            related,
            kind,
        });
        self.nodes[owner.0].edges.push(id);
        if related != owner {
            self.nodes[related.0].edges.push(id);
        }
        id
    }
}
