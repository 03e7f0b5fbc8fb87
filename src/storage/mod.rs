//! Storage seam: the write calls issued by reconciliation and the fetch of
//! the current graph.
//!
//! Requests are owned values built before a call is dispatched, so no graph
//! node is borrowed across a suspension point.

mod memory;
#[cfg(feature = "sqlite-backend")]
mod sqlite;

pub use memory::{MemoryStorage, StorageCall, StorageOp};
#[cfg(feature = "sqlite-backend")]
pub use sqlite::{SCHEMA_VERSION, SqliteStorage};

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::{StorageError, UpsertGraphError};
use crate::graph::{ModelGraph, NodeId};
use crate::model::{Entity, EntityType, IdKey, PropertyList, Relation, loosely_equal};

/// One stored row, keyed by column name.
pub type Row = Map<String, Value>;

/// Where a write is addressed.
#[derive(Clone, Debug)]
pub enum WriteScope {
    /// Directly on the entity's own table.
    Root,
    /// Through `relation` of the owner identified by `owner_id`.
    Related {
        owner_type: Arc<EntityType>,
        owner_id: IdKey,
        relation: Arc<Relation>,
    },
}

impl WriteScope {
    pub fn relation(&self) -> Option<&Arc<Relation>> {
        match self {
            WriteScope::Root => None,
            WriteScope::Related { relation, .. } => Some(relation),
        }
    }
}

/// Bulk insert of rows of one entity type.
#[derive(Clone, Debug)]
pub struct InsertRequest {
    pub entity_type: Arc<EntityType>,
    pub rows: Vec<Row>,
}

/// Rows for a many-to-many join table.
#[derive(Clone, Debug)]
pub struct JoinRowRequest {
    pub relation: Arc<Relation>,
    pub rows: Vec<Row>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Only the columns in the payload change.
    Patch,
    /// The payload replaces every non-identifier column.
    Update,
}

#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub scope: WriteScope,
    pub entity_type: Arc<EntityType>,
    pub mode: UpdateMode,
    pub id: IdKey,
    pub row: Row,
}

/// Delete or unrelate of several rows sharing one scope.
#[derive(Clone, Debug)]
pub struct RemoveRequest {
    pub scope: WriteScope,
    pub entity_type: Arc<EntityType>,
    pub ids: Vec<IdKey>,
}

/// Write surface used by reconciliation.
#[async_trait]
pub trait GraphStorage: Send + Sync {
    /// Bulk insert limit of the backend, if it has one.
    fn max_batch_size(&self) -> Option<usize> {
        None
    }

    /// Inserts the rows and returns, per row and in request order, the
    /// values the storage generated (keys, defaults).
    async fn insert(&self, request: InsertRequest) -> Result<Vec<Row>, StorageError>;

    async fn insert_join_rows(&self, request: JoinRowRequest) -> Result<(), StorageError>;

    async fn update(&self, request: UpdateRequest) -> Result<(), StorageError>;

    async fn delete(&self, request: RemoveRequest) -> Result<(), StorageError>;

    /// Breaks the link described by the scope without deleting the rows.
    async fn unrelate(&self, request: RemoveRequest) -> Result<(), StorageError>;
}

/// Produces the current graph for a desired graph.
#[async_trait]
pub trait GraphFetcher: Send + Sync {
    async fn fetch_current(&self, desired: &ModelGraph) -> Result<ModelGraph, UpsertGraphError>;
}

/// Read access used by [`fetch_current_graph`].
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn find_by_id(
        &self,
        entity_type: &EntityType,
        id: &IdKey,
    ) -> Result<Option<Row>, StorageError>;

    /// Rows reachable from `owner` through `relation`. Many-to-many rows carry
    /// the join-table extras as plain properties.
    async fn find_related(&self, relation: &Relation, owner: &Row) -> Result<Vec<Row>, StorageError>;
}

/// Loads the stored counterparts of `desired`: every root that carries an id,
/// then every relation the desired graph uses below it, all the way down.
pub async fn fetch_current_graph<S>(
    source: &S,
    desired: &ModelGraph,
) -> Result<ModelGraph, UpsertGraphError>
where
    S: RowSource + ?Sized,
{
    let tree = RelationTree::build(desired);
    let mut current = ModelGraph::new(desired.shape());
    let mut queue: Vec<NodeId> = Vec::new();

    for &root in desired.roots() {
        let node = desired.node(root);
        let Some(id) = node.entity().id_key(&node.entity_type().id_props) else {
            continue;
        };
        if let Some(row) = source.find_by_id(node.entity_type(), &id).await? {
            let added = current.add_root(Arc::clone(node.entity_type()), Entity::from_props(row));
            queue.push(added);
        }
    }

    while let Some(owner) = queue.pop() {
        let path = current.node(owner).relation_path().to_string();
        let owner_row = current.node(owner).entity().props().clone();
        for (relation, related_type) in tree.children(&path) {
            let rows = source.find_related(relation, &owner_row).await?;
            for row in rows {
                let child = current.add_child(
                    owner,
                    Arc::clone(relation),
                    Arc::clone(related_type),
                    Entity::from_props(row),
                )?;
                queue.push(child);
            }
        }
    }

    Ok(current)
}

/// Relations used below each relation path of a graph, deduplicated by name.
/// A relation set to `null` on a desired node counts as used when its type
/// declares it with [`EntityType::with_related`].
struct RelationTree {
    children: AHashMap<String, Vec<(Arc<Relation>, Arc<EntityType>)>>,
}

impl RelationTree {
    fn build(graph: &ModelGraph) -> Self {
        let mut tree = Self {
            children: AHashMap::new(),
        };
        for node in graph.nodes() {
            for (prop, value) in node.entity().props() {
                if !value.is_null() {
                    continue;
                }
                if let Some(def) = node.entity_type().relation(prop) {
                    tree.add(node.relation_path(), &def.relation, &def.related_type);
                }
            }
            let (Some(parent), Some(edge)) = (node.parent_node(), node.parent_edge()) else {
                continue;
            };
            let Some(relation) = graph.edge(edge).relation() else {
                continue;
            };
            tree.add(graph.node(parent).relation_path(), relation, node.entity_type());
        }
        tree
    }

    fn add(&mut self, path: &str, relation: &Arc<Relation>, related_type: &Arc<EntityType>) {
        let entry = self.children.entry(path.to_string()).or_default();
        if !entry.iter().any(|(known, _)| known.name == relation.name) {
            entry.push((Arc::clone(relation), Arc::clone(related_type)));
        }
    }

    fn children(&self, path: &str) -> &[(Arc<Relation>, Arc<EntityType>)] {
        match self.children.get(path) {
            Some(children) => children,
            None => &[],
        }
    }
}

/// Whether `left.<left_props>` equals `right.<right_props>` position by
/// position. Missing or null keys never match.
pub(crate) fn keys_match(
    left: &Row,
    left_props: &[String],
    right: &Row,
    right_props: &[String],
) -> bool {
    left_props.len() == right_props.len()
        && left_props.iter().zip(right_props).all(|(l, r)| {
            let (a, b) = (left.get(l), right.get(r));
            !matches!(a, None | Some(Value::Null)) && loosely_equal(a, b)
        })
}

/// Whether `row` holds the identifier `id` in `id_props`.
pub(crate) fn row_has_id(row: &Row, id_props: &[String], id: &IdKey) -> bool {
    id_props.len() == id.values().len()
        && id_props
            .iter()
            .zip(id.values())
            .all(|(prop, value)| loosely_equal(row.get(prop), Some(value)))
}

/// Whether `row` holds `values` in `columns`, position by position.
pub(crate) fn columns_hold(row: &Row, columns: &[String], values: &[Value]) -> bool {
    columns.len() == values.len()
        && columns
            .iter()
            .zip(values)
            .all(|(column, value)| loosely_equal(row.get(column), Some(value)))
}

pub(crate) fn row_from_json(value: Value) -> Result<Row, StorageError> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(StorageError::invalid_input(format!(
            "row must be a JSON object, got {other}"
        ))),
    }
}

/// Key values of `row` at `props`, or an error naming the first missing one.
pub(crate) fn key_values(
    row: &Row,
    props: &PropertyList,
    what: &str,
) -> Result<Vec<Value>, StorageError> {
    props
        .props()
        .iter()
        .map(|prop| match row.get(prop) {
            None | Some(Value::Null) => Err(StorageError::invalid_input(format!(
                "{what} is missing key property {prop}"
            ))),
            Some(value) => Ok(value.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_keys_match_is_loose_and_rejects_nulls() {
        let owner = row(json!({"id": 5}));
        let child = row(json!({"order_id": "5"}));
        let props = |p: &str| vec![p.to_string()];
        assert!(keys_match(&owner, &props("id"), &child, &props("order_id")));
        let orphan = row(json!({"order_id": null}));
        let no_id = row(json!({"id": null}));
        assert!(!keys_match(&no_id, &props("id"), &orphan, &props("order_id")));
    }

    #[test]
    fn test_row_has_composite_id() {
        let r = row(json!({"a": 1, "b": "x"}));
        let ids = vec!["a".to_string(), "b".to_string()];
        assert!(row_has_id(&r, &ids, &IdKey::new(vec![json!(1), json!("x")])));
        assert!(!row_has_id(&r, &ids, &IdKey::single(1)));
    }
}
