//! One insert batch: prepare chunks, write them, hand keys to dependents.

use std::sync::Arc;

use ahash::AHashMap;
use serde_json::Value;
use tracing::debug;

use crate::action::{ActionContext, dispatch};
use crate::errors::{StorageError, UpsertGraphError};
use crate::graph::{EdgeId, EdgeKind, GraphPair, ModelGraph, NodeId};
use crate::model::{EntityType, ValidationContext, is_temp_column};
use crate::reference;
use crate::storage::{GraphStorage, InsertRequest};
use crate::upsert::UpsertStats;

use super::dependency::DependencyMap;

/// Nodes of one entity type written by a single insert call.
struct PreparedChunk {
    nodes: Vec<NodeId>,
    inserted: Vec<NodeId>,
    request: Option<InsertRequest>,
}

/// Groups `batch` by entity type in first-appearance order and cuts every
/// group into chunks of at most `batch_size` nodes.
fn chunk_by_type(graph: &ModelGraph, batch: &[NodeId], batch_size: usize) -> Vec<Vec<NodeId>> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: AHashMap<&str, Vec<NodeId>> = AHashMap::new();
    for &id in batch {
        let name = graph.node(id).entity_type().name.as_str();
        groups
            .entry(name)
            .or_insert_with(|| {
                order.push(name);
                Vec::new()
            })
            .push(id);
    }
    order
        .into_iter()
        .filter_map(|name| groups.remove(name))
        .flat_map(|nodes| {
            nodes
                .chunks(batch_size)
                .map(<[NodeId]>::to_vec)
                .collect::<Vec<_>>()
        })
        .collect()
}

pub(crate) async fn run_batch<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    deps: &DependencyMap,
    batch: &[NodeId],
    stats: &mut UpsertStats,
) -> Result<(), UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    let chunks = chunk_by_type(pair.desired(), batch, ctx.batch_size());
    let mut prepared = Vec::with_capacity(chunks.len());
    for nodes in chunks {
        prepared.push(prepare_chunk(ctx, pair, nodes)?);
    }

    let requests: Vec<InsertRequest> = prepared
        .iter_mut()
        .filter_map(|chunk| chunk.request.take())
        .collect();
    let calls = requests.len();
    for request in &requests {
        debug!(
            entity_type = %request.entity_type.name,
            rows = request.rows.len(),
            "upsert.insert.chunk"
        );
    }
    let mut generated = dispatch(requests, ctx.concurrency(calls), |request| {
        ctx.storage.insert(request)
    })
    .await?
    .into_iter();
    stats.storage_calls += calls;

    for chunk in prepared {
        if !chunk.inserted.is_empty() {
            let rows = generated.next().unwrap_or_default();
            if rows.len() != chunk.inserted.len() {
                return Err(StorageError::query(format!(
                    "storage returned {} generated rows for {} inserted",
                    rows.len(),
                    chunk.inserted.len()
                ))
                .into());
            }
            for (&id, values) in chunk.inserted.iter().zip(rows) {
                pair.desired.node_mut(id).entity_mut().merge(values);
            }
            stats.inserted += chunk.inserted.len();
        }
        for &id in &chunk.nodes {
            resolve_dependents(&mut pair.desired, deps, id)?;
        }
    }
    Ok(())
}

fn prepare_chunk<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    nodes: Vec<NodeId>,
) -> Result<PreparedChunk, UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    for &id in &nodes {
        let parent_relation = pair
            .desired
            .node(id)
            .parent_edge()
            .and_then(|edge| pair.desired.edge(edge).relation().cloned());

        // Join-table extras stay on the entity but never reach its own row.
        if let Some(relation) = &parent_relation {
            relation.omit_extra_props(pair.desired.node_mut(id).entity_mut());
        }

        // Keep stored columns the caller did not mention.
        if let Some(current) = pair.current_of(id) {
            let stored: Vec<(String, Value)> = pair
                .current
                .node(current)
                .entity()
                .props()
                .iter()
                .filter(|(prop, _)| !is_temp_column(prop))
                .map(|(prop, value)| (prop.clone(), value.clone()))
                .collect();
            let entity = pair.desired.node_mut(id).entity_mut();
            for (prop, value) in stored {
                if !entity.contains(&prop) {
                    entity.set(&prop, value);
                }
            }
        }

        if let Some(relation) = &parent_relation {
            let node = pair.desired.node_mut(id);
            let data_path = node.data_path().to_string();
            relation
                .before_insert(node.entity_mut())
                .map_err(|message| UpsertGraphError::validation(data_path, message))?;
        }
    }

    let inserted: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|&id| ctx.options.should_insert(pair, id))
        .collect();
    let Some(&first) = nodes.first() else {
        return Ok(PreparedChunk {
            nodes,
            inserted,
            request: None,
        });
    };
    let entity_type: Arc<EntityType> = Arc::clone(pair.desired.node(first).entity_type());

    let mut rows = Vec::with_capacity(inserted.len());
    for &id in &inserted {
        let node = pair.desired.node_mut(id);
        let data_path = node.data_path().to_string();
        node.entity_mut().remove(&entity_type.uid_prop);
        entity_type
            .validate(
                node.entity(),
                &ValidationContext {
                    data_path: data_path.clone(),
                    patch: false,
                },
            )
            .map_err(|message| UpsertGraphError::validation(data_path, message))?;
        node.flags.inserted = true;
        rows.push(node.entity().database_json(&entity_type.relation_names));
    }

    let request = (!rows.is_empty()).then(|| InsertRequest {
        entity_type: Arc::clone(&entity_type),
        rows,
    });
    Ok(PreparedChunk {
        nodes,
        inserted,
        request,
    })
}

/// Hands the keys of `node` to everything waiting on it.
pub(crate) fn resolve_dependents(
    graph: &mut ModelGraph,
    deps: &DependencyMap,
    node: NodeId,
) -> Result<(), UpsertGraphError> {
    resolve_referencing_nodes(graph, deps, node)?;
    for &edge in deps.dependents(node) {
        resolve_dependency(graph, node, edge)?;
    }
    Ok(())
}

/// Copies the keys of `node` into the placeholders standing for it, then
/// lets each placeholder resolve whatever waits on it.
fn resolve_referencing_nodes(
    graph: &mut ModelGraph,
    deps: &DependencyMap,
    node: NodeId,
) -> Result<(), UpsertGraphError> {
    let placeholders = graph.node(node).referencing_nodes().to_vec();
    for placeholder in placeholders {
        let keys = placeholder_keys(graph, placeholder);
        let values: Vec<(String, Value)> = keys
            .into_iter()
            .filter_map(|prop| {
                let value = graph.node(node).entity().get(&prop)?.clone();
                Some((prop, value))
            })
            .collect();
        let entity = graph.node_mut(placeholder).entity_mut();
        for (prop, value) in values {
            entity.set(&prop, value);
        }
        resolve_dependents(graph, deps, placeholder)?;
    }
    Ok(())
}

/// Properties a placeholder takes over from its target: the identifier, plus
/// the related-side key of its parent relation unless that key is the
/// foreign key the placeholder receives from its parent.
fn placeholder_keys(graph: &ModelGraph, placeholder: NodeId) -> Vec<String> {
    let node = graph.node(placeholder);
    let mut keys = node.entity_type().id_props.clone();
    let relation = node
        .parent_edge()
        .and_then(|edge| graph.edge(edge).relation());
    if let Some(relation) = relation
        && !relation.is_has_many()
    {
        for prop in relation.related_props.props() {
            if !keys.contains(prop) {
                keys.push(prop.clone());
            }
        }
    }
    keys
}

fn resolve_dependency(
    graph: &mut ModelGraph,
    source: NodeId,
    edge: EdgeId,
) -> Result<(), UpsertGraphError> {
    let edge = graph.edge(edge).clone();
    let target = edge.other_node(source);
    let source_is_owner = edge.is_owner_node(source);

    match edge.kind() {
        EdgeKind::Relation(relation) => {
            if relation.join_table().is_some() {
                return Ok(());
            }
            let (from, to) = if source_is_owner {
                (&relation.owner_props, &relation.related_props)
            } else {
                (&relation.related_props, &relation.owner_props)
            };
            let values: Vec<Value> = (0..to.size().min(from.size()))
                .map(|i| {
                    from.get_prop(graph.node(source).entity(), i)
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            let entity = graph.node_mut(target).entity_mut();
            for (i, value) in values.into_iter().enumerate() {
                to.set_prop(entity, i, value);
            }
        }
        EdgeKind::Reference(reference) => {
            let (source_path, target_path) = if source_is_owner {
                (&reference.owner_path, &reference.related_path)
            } else {
                (&reference.related_path, &reference.owner_path)
            };
            let source_node = graph.node(source);
            let target_node = graph.node(target);
            let source_value = source_node
                .entity()
                .get_path(source_path)
                .cloned()
                .ok_or_else(|| {
                    UpsertGraphError::configuration(format!(
                        "reference source {} has no value at {}",
                        source_path.join("."),
                        super::dependency::describe_path(source_node.data_path())
                    ))
                })?;
            let target_value = target_node.entity().get_path(target_path).ok_or_else(|| {
                UpsertGraphError::configuration(format!(
                    "reference target {} has no value at {}",
                    target_path.join("."),
                    super::dependency::describe_path(target_node.data_path())
                ))
            })?;
            let resolved = reference::resolve(target_value, &reference.token, &source_value)
                .ok_or_else(|| {
                    UpsertGraphError::configuration(format!(
                        "reference target {} at {} is not a string",
                        target_path.join("."),
                        super::dependency::describe_path(target_node.data_path())
                    ))
                })?;
            let target_at = super::dependency::describe_path(target_node.data_path());
            if !graph
                .node_mut(target)
                .entity_mut()
                .set_path(target_path, resolved)
            {
                return Err(UpsertGraphError::configuration(format!(
                    "cannot write reference target {} at {target_at}",
                    target_path.join(".")
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{Entity, PropertyList, Relation};

    #[test]
    fn test_chunks_group_by_type_in_first_appearance_order() {
        let order = Arc::new(EntityType::new("Order"));
        let item = Arc::new(EntityType::new("Item"));
        let note = Arc::new(EntityType::new("Note"));
        let items = Arc::new(Relation::has_many(
            "items",
            "Order",
            "Item",
            PropertyList::new(["id"]),
            PropertyList::new(["order_id"]),
        ));
        let notes = Arc::new(Relation::has_many(
            "notes",
            "Order",
            "Note",
            PropertyList::new(["id"]),
            PropertyList::new(["order_id"]),
        ));
        let mut graph = ModelGraph::single();
        let root = graph.add_root(order, Entity::new());
        let mut ids = Vec::new();
        for i in 0..5 {
            let (rel, ty) = if i == 1 {
                (Arc::clone(&notes), Arc::clone(&note))
            } else {
                (Arc::clone(&items), Arc::clone(&item))
            };
            ids.push(graph.add_child(root, rel, ty, Entity::new()).unwrap());
        }
        let chunks = chunk_by_type(&graph, &ids, 2);
        assert_eq!(
            chunks,
            vec![vec![ids[0], ids[2]], vec![ids[3], ids[4]], vec![ids[1]]]
        );
    }

    #[test]
    fn test_reference_resolution_splices_generated_key() {
        let doc = Arc::new(EntityType::new("Doc"));
        let mut graph = ModelGraph::many();
        let a = graph.add_root(
            Arc::clone(&doc),
            Entity::from_json(json!({"id": 42})).unwrap(),
        );
        let b = graph.add_root(
            doc,
            Entity::from_json(json!({"link": "id=#ref-1;", "copy": "#ref-1"})).unwrap(),
        );
        graph
            .add_property_reference(b, "link", a, "id", "#ref-1")
            .unwrap();
        graph
            .add_property_reference(b, "copy", a, "id", "#ref-1")
            .unwrap();
        let deps = DependencyMap::build(&graph);
        resolve_dependents(&mut graph, &deps, a).unwrap();
        assert_eq!(graph.node(b).entity().get("link"), Some(&json!("id=42;")));
        assert_eq!(graph.node(b).entity().get("copy"), Some(&json!(42)));
    }

    #[test]
    fn test_non_string_reference_target_is_rejected() {
        let doc = Arc::new(EntityType::new("Doc"));
        let mut graph = ModelGraph::many();
        let a = graph.add_root(
            Arc::clone(&doc),
            Entity::from_json(json!({"id": 1})).unwrap(),
        );
        let b = graph.add_root(doc, Entity::from_json(json!({"link": 5})).unwrap());
        graph.add_property_reference(b, "link", a, "id", "#x").unwrap();
        let deps = DependencyMap::build(&graph);
        assert!(matches!(
            resolve_dependents(&mut graph, &deps, a),
            Err(UpsertGraphError::Configuration(_))
        ));
    }
}
