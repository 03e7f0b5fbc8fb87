//! Reconciliation entry point.
//!
//! A run checks the desired graph against the current one, computes the
//! insert order, then executes the delete, insert and patch phases in that
//! order. Nothing is written until the checks and the insert order have
//! succeeded. The engine never opens a transaction itself; wrap a run in one
//! (see [`SqliteStorage::begin`](crate::storage::SqliteStorage)) to make a
//! failed phase roll back cleanly.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::action::{ActionContext, Phase};
use crate::config::{ExecutionConfig, UpsertOptions};
use crate::delete;
use crate::errors::UpsertGraphError;
use crate::graph::{EdgeKind, GraphPair, InputShape, ModelGraph, NodeId};
use crate::insert;
use crate::model::{Entity, RelationKind};
use crate::patch;
use crate::policy::GraphOptions;
use crate::storage::{GraphFetcher, GraphStorage};

/// Counters collected over one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub inserted: usize,
    pub related: usize,
    pub patched: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unrelated: usize,
    /// Storage calls issued across all phases.
    pub storage_calls: usize,
}

/// The reconciled entities, shaped like the input.
#[derive(Clone, Debug, PartialEq)]
pub enum Upserted {
    One(Entity),
    Many(Vec<Entity>),
}

/// Result of a successful run.
#[derive(Clone, Debug)]
pub struct UpsertOutcome {
    graph: ModelGraph,
    stats: UpsertStats,
}

impl UpsertOutcome {
    /// The desired graph with generated keys filled in and per-node
    /// `inserted`/`updated` flags set.
    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    pub fn stats(&self) -> UpsertStats {
        self.stats
    }

    /// Root entities, one or many as in the input.
    pub fn result(&self) -> Upserted {
        let mut roots: Vec<Entity> = self
            .graph
            .roots()
            .iter()
            .map(|&id| self.graph.node(id).entity().clone())
            .collect();
        if self.graph.shape() == InputShape::One
            && roots.len() == 1
            && let Some(root) = roots.pop()
        {
            return Upserted::One(root);
        }
        Upserted::Many(roots)
    }

    /// Roots as JSON with every child nested under its relation name.
    pub fn into_json(self) -> Value {
        let roots: Vec<Value> = self
            .graph
            .roots()
            .iter()
            .map(|&id| node_json(&self.graph, id))
            .collect();
        match self.graph.shape() {
            InputShape::One if roots.len() == 1 => roots.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(roots),
        }
    }
}

fn node_json(graph: &ModelGraph, id: NodeId) -> Value {
    let node = graph.node(id);
    let mut object: Map<String, Value> = node.entity().props().clone();
    let mut many: Vec<(String, Vec<Value>)> = Vec::new();

    for &edge_id in node.edges() {
        let edge = graph.edge(edge_id);
        let EdgeKind::Relation(relation) = edge.kind() else {
            continue;
        };
        let child = edge.related_node();
        if !edge.is_owner_node(id) || graph.node(child).parent_edge() != Some(edge_id) {
            continue;
        }
        let value = node_json(graph, child);
        match relation.kind {
            RelationKind::BelongsToOne => {
                object.insert(relation.name.clone(), value);
            }
            RelationKind::HasMany | RelationKind::ManyToMany(_) => {
                match many.iter_mut().find(|(name, _)| *name == relation.name) {
                    Some((_, values)) => values.push(value),
                    None => many.push((relation.name.clone(), vec![value])),
                }
            }
        }
    }
    for (name, values) in many {
        object.insert(name, Value::Array(values));
    }
    Value::Object(object)
}

/// Reconciles desired graphs against a storage.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use serde_json::json;
/// use upsertgraph::{
///     Entity, EntityType, MemoryStorage, ModelGraph, PropertyList, Relation, UpsertGraph,
/// };
///
/// # tokio_test_block(async {
/// let order = Arc::new(EntityType::new("Order").with_relation("items"));
/// let item = Arc::new(EntityType::new("Item"));
/// let items = Arc::new(Relation::has_many(
///     "items",
///     "Order",
///     "Item",
///     PropertyList::new(["id"]),
///     PropertyList::new(["order_id"]),
/// ));
///
/// let mut desired = ModelGraph::single();
/// let root = desired.add_root(order, Entity::from_json(json!({"no": "A-1"})).unwrap());
/// desired
///     .add_child(root, items, item, Entity::from_json(json!({"sku": "x"})).unwrap())
///     .unwrap();
///
/// let storage = MemoryStorage::new();
/// let outcome = UpsertGraph::new(&storage).run(desired, &storage).await.unwrap();
/// assert_eq!(outcome.stats().inserted, 2);
/// assert_eq!(
///     outcome.into_json(),
///     json!({"id": 1, "no": "A-1", "items": [{"id": 1, "order_id": 1, "sku": "x"}]})
/// );
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct UpsertGraph<'a, S: ?Sized> {
    storage: &'a S,
    options: GraphOptions,
    config: ExecutionConfig,
}

impl<'a, S> UpsertGraph<'a, S>
where
    S: GraphStorage + ?Sized,
{
    pub fn new(storage: &'a S) -> Self {
        Self {
            storage,
            options: GraphOptions::default(),
            config: ExecutionConfig::default(),
        }
    }

    pub fn with_options(mut self, options: UpsertOptions) -> Self {
        self.options = GraphOptions::new(options);
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetches the current graph through `fetcher`, then reconciles.
    pub async fn run<F>(
        &self,
        desired: ModelGraph,
        fetcher: &F,
    ) -> Result<UpsertOutcome, UpsertGraphError>
    where
        F: GraphFetcher + ?Sized,
    {
        let current = fetcher.fetch_current(&desired).await?;
        self.run_with_current(desired, current).await
    }

    #[instrument(skip_all, fields(nodes = desired.len(), current = current.len()))]
    pub async fn run_with_current(
        &self,
        desired: ModelGraph,
        current: ModelGraph,
    ) -> Result<UpsertOutcome, UpsertGraphError> {
        self.config.validate()?;
        if desired.shape() == InputShape::One && desired.roots().len() != 1 {
            return Err(UpsertGraphError::configuration(format!(
                "a single-object graph needs exactly one root, got {}",
                desired.roots().len()
            )));
        }

        let mut pair = GraphPair::new(desired, current);
        check_for_errors(&self.options, &pair)?;
        let plan = insert::plan(&pair)?;

        let ctx = ActionContext {
            storage: self.storage,
            options: &self.options,
            config: &self.config,
        };
        let mut stats = UpsertStats {
            related: pair
                .desired()
                .node_ids()
                .filter(|&id| self.options.should_relate(&pair, id))
                .count(),
            ..UpsertStats::default()
        };

        delete::run(&ctx, &pair, &mut stats).await?;
        info!(
            phase = %Phase::Delete,
            deleted = stats.deleted,
            unrelated = stats.unrelated,
            "upsert.phase.completed"
        );

        insert::run(&ctx, &mut pair, &plan, &mut stats).await?;
        info!(
            phase = %Phase::Insert,
            batches = plan.batches().len(),
            inserted = stats.inserted,
            "upsert.phase.completed"
        );

        patch::run(&ctx, &mut pair, &mut stats).await?;
        info!(
            phase = %Phase::Patch,
            patched = stats.patched,
            updated = stats.updated,
            "upsert.phase.completed"
        );

        Ok(UpsertOutcome {
            graph: pair.into_desired(),
            stats,
        })
    }
}

/// Rejects nodes that carry an id but would silently do nothing: not stored,
/// not inserted, not related.
pub(crate) fn check_for_errors(
    options: &GraphOptions,
    pair: &GraphPair,
) -> Result<(), UpsertGraphError> {
    for id in pair.desired().node_ids() {
        let node = pair.desired().node(id);
        if node.has_id()
            && !options.should_insert_or_relate(pair, id)
            && !options.is_insert_disabled(pair, id)
            && !options.is_relate_disabled(pair, id)
            && pair.current_of(id).is_none()
        {
            let message = match node.parent_node() {
                None => format!(
                    "root model (id={}) does not exist. If you want to insert it with an id, \
                     use the insertMissing option",
                    node.describe_id()
                ),
                Some(parent) => format!(
                    "model (id={}) is not a child of model (id={}). If you want to relate it, \
                     use the relate option. If you want to insert it with an id, use the \
                     insertMissing option",
                    node.describe_id(),
                    pair.desired().node(parent).describe_id()
                ),
            };
            return Err(UpsertGraphError::configuration(message));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::model::{EntityType, PropertyList, Relation};

    #[test]
    fn test_into_json_nests_children_under_relation_names() {
        let order = Arc::new(EntityType::new("Order").with_relation("items"));
        let item = Arc::new(EntityType::new("Item").with_relation("product"));
        let product = Arc::new(EntityType::new("Product"));
        let items = Arc::new(Relation::has_many(
            "items",
            "Order",
            "Item",
            PropertyList::new(["id"]),
            PropertyList::new(["order_id"]),
        ));
        let owner = Arc::new(Relation::belongs_to_one(
            "product",
            "Item",
            "Product",
            PropertyList::new(["product_id"]),
            PropertyList::new(["id"]),
        ));
        let mut graph = ModelGraph::single();
        let root = graph.add_root(order, Entity::from_json(json!({"id": 1})).unwrap());
        let first = graph
            .add_child(
                root,
                Arc::clone(&items),
                Arc::clone(&item),
                Entity::from_json(json!({"id": 2})).unwrap(),
            )
            .unwrap();
        graph
            .add_child(root, items, item, Entity::from_json(json!({"id": 3})).unwrap())
            .unwrap();
        graph
            .add_child(first, owner, product, Entity::from_json(json!({"id": 9})).unwrap())
            .unwrap();

        let outcome = UpsertOutcome {
            graph,
            stats: UpsertStats::default(),
        };
        assert!(matches!(outcome.result(), Upserted::One(_)));
        assert_eq!(
            outcome.into_json(),
            json!({"id": 1, "items": [{"id": 2, "product": {"id": 9}}, {"id": 3}]})
        );
    }
}
