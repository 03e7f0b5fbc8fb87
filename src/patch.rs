//! Patch phase.
//!
//! Every desired node that already exists (or is being related) is diffed
//! against its stored counterpart. Belongs-to-one foreign keys owned by the
//! node are rewritten first, because inserting, relating, deleting or
//! unrelating the related row changes them even when the caller did not.

use std::sync::Arc;

use ahash::AHashSet;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::action::{ActionContext, dispatch};
use crate::errors::UpsertGraphError;
use crate::graph::{GraphPair, NodeId};
use crate::model::{ValidationContext, is_internal_prop, loosely_equal};
use crate::storage::{GraphStorage, UpdateMode, UpdateRequest, WriteScope};
use crate::upsert::UpsertStats;

/// Properties of a desired entity split by whether writing them would change
/// the stored row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Changes {
    pub(crate) changed: Vec<String>,
    pub(crate) unchanged: Vec<String>,
}

/// Nodes considered by the patch phase.
pub(crate) fn candidates<S>(ctx: &ActionContext<'_, S>, pair: &GraphPair) -> Vec<NodeId>
where
    S: GraphStorage + ?Sized,
{
    pair.desired
        .node_ids()
        .filter(|&id| {
            !pair.desired.node(id).flags().inserted
                && (ctx.options.should_patch_or_update(pair, id) || pair.current_of(id).is_some())
        })
        .collect()
}

#[instrument(skip_all)]
pub(crate) async fn run<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    stats: &mut UpsertStats,
) -> Result<(), UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    let mut requests = Vec::new();
    for id in candidates(ctx, pair) {
        if let Some(request) = prepare(ctx, pair, id)? {
            requests.push(request);
        }
    }

    let calls = requests.len();
    let patched = requests
        .iter()
        .filter(|request| request.mode == UpdateMode::Patch)
        .count();
    debug!(calls, patched, "upsert.patch.dispatch");
    dispatch(requests, ctx.concurrency(calls), |request| {
        ctx.storage.update(request)
    })
    .await?;

    stats.patched += patched;
    stats.updated += calls - patched;
    stats.storage_calls += calls;
    Ok(())
}

/// Builds the update for one node, or `None` when nothing would change.
fn prepare<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    id: NodeId,
) -> Result<Option<UpdateRequest>, UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    let should_patch = ctx.options.should_patch(pair, id);
    let should_update = ctx.options.should_update(pair, id);

    let mut forced = cascade_belongs_to_one_inserts(ctx, pair, id);
    for prop in cascade_belongs_to_one_deletes(ctx, pair, id) {
        if !forced.contains(&prop) {
            forced.push(prop);
        }
    }
    let changes = find_changes(pair, id);

    let node = pair.desired.node(id);
    let entity_type = Arc::clone(node.entity_type());
    let scope = write_scope(pair, id)?;
    let parent_relation = node
        .parent_edge()
        .and_then(|edge| pair.desired.edge(edge).relation().cloned());
    // Join-table extras only reach storage through the owning relation.
    let extras: &[String] = match (&scope, &parent_relation) {
        (WriteScope::Root, Some(relation)) => relation.join_table_extras(),
        _ => &[],
    };

    let mut write_set = if should_patch || should_update {
        changes.changed.clone()
    } else {
        forced
    };
    write_set.retain(|prop| {
        !entity_type.is_id_prop(prop) && !extras.contains(prop) && !node.entity().is_omitted(prop)
    });
    if write_set.is_empty() {
        return Ok(None);
    }

    let data_path = node.data_path().to_string();
    entity_type
        .validate(
            node.entity(),
            &ValidationContext {
                data_path: data_path.clone(),
                patch: !should_update,
            },
        )
        .map_err(|message| UpsertGraphError::validation(data_path.clone(), message))?;

    let mode = if should_update {
        UpdateMode::Update
    } else {
        UpdateMode::Patch
    };
    let key = node
        .entity()
        .id_key(&entity_type.id_props)
        .ok_or_else(|| {
            UpsertGraphError::configuration(format!(
                "cannot update {} at {} without an id",
                entity_type.name,
                crate::insert::describe_path(&data_path)
            ))
        })?;

    // A full update carries the whole object; a patch only what changes.
    let payload: AHashSet<&str> = match mode {
        UpdateMode::Patch => write_set.iter().map(String::as_str).collect(),
        UpdateMode::Update => write_set
            .iter()
            .chain(changes.unchanged.iter())
            .filter(|prop| !entity_type.is_id_prop(prop))
            .map(String::as_str)
            .collect(),
    };
    let omitted: Vec<String> = changes
        .changed
        .iter()
        .chain(changes.unchanged.iter())
        .filter(|prop| !payload.contains(prop.as_str()))
        .cloned()
        .collect();

    let extras = extras.to_vec();
    let node = pair.desired.node_mut(id);
    let entity = node.entity_mut();
    entity.reset_write_omitted();
    entity.omit_for_write(omitted);
    entity.omit_for_write(extras);
    let row = entity.database_json(&entity_type.relation_names);
    node.flags.updated = true;

    debug!(
        entity_type = %entity_type.name,
        id = %key,
        columns = row.len(),
        "upsert.patch.node"
    );
    Ok(Some(UpdateRequest {
        scope,
        entity_type,
        mode,
        id: key,
        row,
    }))
}

/// Rewrites belongs-to-one keys owned by `id` whose related node is inserted
/// or related. Returns the rewritten properties.
fn cascade_belongs_to_one_inserts<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    id: NodeId,
) -> Vec<String>
where
    S: GraphStorage + ?Sized,
{
    let current = pair.current_of(id);
    let mut updates: Vec<(String, Value)> = Vec::new();

    for &edge_id in pair.desired.node(id).edges() {
        let edge = pair.desired.edge(edge_id);
        let Some(relation) = edge.relation() else {
            continue;
        };
        if !edge.is_owner_node(id) || !relation.is_belongs_to_one() {
            continue;
        }
        let related = edge.related_node();
        if !(pair.desired.node(related).flags().inserted
            || ctx.options.should_insert_or_relate(pair, related))
        {
            continue;
        }
        let related_entity = pair.desired.node(related).entity();
        for i in 0..relation.owner_props.size().min(relation.related_props.size()) {
            let current_value = current
                .and_then(|c| relation.owner_props.get_prop(pair.current.node(c).entity(), i));
            let related_value = relation.related_props.get_prop(related_entity, i);
            if !loosely_equal(current_value, related_value) {
                updates.push((
                    relation.owner_props.prop(i).to_string(),
                    related_value.cloned().unwrap_or(Value::Null),
                ));
            }
        }
    }

    let entity = pair.desired.node_mut(id).entity_mut();
    let mut props = Vec::with_capacity(updates.len());
    for (prop, value) in updates {
        entity.set(&prop, value);
        if !props.contains(&prop) {
            props.push(prop);
        }
    }
    props
}

/// Clears belongs-to-one keys owned by `id` when the caller nulled the
/// relation and the stored related row goes away. Returns the cleared
/// properties.
fn cascade_belongs_to_one_deletes<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    id: NodeId,
) -> Vec<String>
where
    S: GraphStorage + ?Sized,
{
    let Some(current) = pair.current_of(id) else {
        return Vec::new();
    };
    let desired_entity = pair.desired.node(id).entity();
    let current_node = pair.current.node(current);
    let mut cleared: Vec<String> = Vec::new();

    for &edge_id in current_node.edges() {
        let edge = pair.current.edge(edge_id);
        let Some(relation) = edge.relation() else {
            continue;
        };
        if !edge.is_owner_node(current)
            || !relation.is_belongs_to_one()
            || desired_entity.get(&relation.name) != Some(&Value::Null)
            || !ctx
                .options
                .should_delete_or_unrelate(pair, edge.related_node())
        {
            continue;
        }
        for i in 0..relation.owner_props.size() {
            let stored = relation.owner_props.get_prop(current_node.entity(), i);
            let prop = relation.owner_props.prop(i).to_string();
            if !matches!(stored, None | Some(Value::Null)) && !cleared.contains(&prop) {
                cleared.push(prop);
            }
        }
    }

    let entity = pair.desired.node_mut(id).entity_mut();
    for prop in &cleared {
        entity.set(prop, Value::Null);
    }
    cleared
}

/// Diffs the desired entity against its stored counterpart. A property the
/// stored row lacks counts as changed, and so does every query property.
pub(crate) fn find_changes(pair: &GraphPair, id: NodeId) -> Changes {
    let node = pair.desired.node(id);
    let entity = node.entity();
    let current = pair
        .current_of(id)
        .map(|c| pair.current.node(c).entity());

    let mut changes = Changes::default();
    for (prop, value) in entity.props() {
        if is_internal_prop(prop) || node.entity_type().is_relation(prop) {
            continue;
        }
        let stored = current.and_then(|c| c.get(prop));
        if stored.is_none() || !loosely_equal(stored, Some(value)) {
            changes.changed.push(prop.clone());
        } else {
            changes.unchanged.push(prop.clone());
        }
    }
    for prop in entity.query_props().keys() {
        if !changes.changed.contains(prop) {
            changes.changed.push(prop.clone());
        }
    }
    changes
}

/// Through the desired parent when the stored row has one, otherwise on the
/// entity's own table.
fn write_scope(pair: &GraphPair, id: NodeId) -> Result<WriteScope, UpsertGraphError> {
    let nested = pair
        .current_of(id)
        .is_some_and(|c| pair.current.node(c).parent_edge().is_some());
    let node = pair.desired.node(id);
    let (true, Some(parent), Some(edge)) = (nested, node.parent_node(), node.parent_edge()) else {
        return Ok(WriteScope::Root);
    };
    let Some(relation) = pair.desired.edge(edge).relation() else {
        return Ok(WriteScope::Root);
    };
    let parent = pair.desired.node(parent);
    let owner_id = parent
        .entity()
        .id_key(&parent.entity_type().id_props)
        .ok_or_else(|| {
            UpsertGraphError::configuration(format!(
                "parent of {} has no id",
                crate::insert::describe_path(node.data_path())
            ))
        })?;
    Ok(WriteScope::Related {
        owner_type: Arc::clone(parent.entity_type()),
        owner_id,
        relation: Arc::clone(relation),
    })
}
