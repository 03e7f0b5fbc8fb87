//! Delete phase: stored rows missing from the desired graph are deleted or
//! unrelated, deepest first.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::action::{ActionContext, dispatch};
use crate::errors::UpsertGraphError;
use crate::graph::{GraphPair, NodeId};
use crate::model::IdKey;
use crate::storage::{GraphStorage, RemoveRequest, WriteScope};
use crate::upsert::UpsertStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RemoveAction {
    Delete,
    Unrelate,
}

/// Current nodes sharing a parent, a relation and an action.
#[derive(Debug)]
struct RemoveGroup {
    parent: Option<NodeId>,
    relation: Option<String>,
    action: RemoveAction,
    depth: usize,
    nodes: Vec<NodeId>,
}

/// What happens to a current node, if anything.
pub(crate) fn action_for<S>(
    ctx: &ActionContext<'_, S>,
    pair: &GraphPair,
    current: NodeId,
) -> Option<RemoveAction>
where
    S: GraphStorage + ?Sized,
{
    if ctx.options.should_delete(pair, current) {
        Some(RemoveAction::Delete)
    } else if ctx.options.should_unrelate(pair, current) {
        Some(RemoveAction::Unrelate)
    } else {
        None
    }
}

fn groups<S>(ctx: &ActionContext<'_, S>, pair: &GraphPair) -> Vec<RemoveGroup>
where
    S: GraphStorage + ?Sized,
{
    let mut groups: Vec<RemoveGroup> = Vec::new();
    for id in pair.current.node_ids() {
        let Some(action) = action_for(ctx, pair, id) else {
            continue;
        };
        let node = pair.current.node(id);
        let parent = node.parent_node();
        let relation = node
            .parent_edge()
            .and_then(|edge| pair.current.edge(edge).relation())
            .map(|relation| relation.name.clone());
        match groups.iter_mut().find(|group| {
            group.parent == parent && group.relation == relation && group.action == action
        }) {
            Some(group) => group.nodes.push(id),
            None => groups.push(RemoveGroup {
                parent,
                relation,
                action,
                depth: pair.current.ancestors(id).count(),
                nodes: vec![id],
            }),
        }
    }
    // Stable, so groups of equal depth keep first-appearance order.
    groups.sort_by(|a, b| b.depth.cmp(&a.depth));
    groups
}

fn request_for(
    pair: &GraphPair,
    group: &RemoveGroup,
) -> Result<RemoveRequest, UpsertGraphError> {
    let first = pair.current.node(group.nodes[0]);
    let entity_type = Arc::clone(first.entity_type());
    let scope = match (group.parent, first.parent_edge()) {
        (Some(parent), Some(edge)) => {
            let parent = pair.current.node(parent);
            let relation = pair.current.edge(edge).relation().cloned().ok_or_else(|| {
                UpsertGraphError::configuration(format!(
                    "{} is not reached through a relation",
                    entity_type.name
                ))
            })?;
            let owner_id = parent
                .entity()
                .id_key(&parent.entity_type().id_props)
                .ok_or_else(|| {
                    UpsertGraphError::configuration(format!(
                        "stored {} has no id",
                        parent.entity_type().name
                    ))
                })?;
            WriteScope::Related {
                owner_type: Arc::clone(parent.entity_type()),
                owner_id,
                relation,
            }
        }
        _ => WriteScope::Root,
    };
    let ids = group
        .nodes
        .iter()
        .map(|&id| {
            let node = pair.current.node(id);
            node.entity()
                .id_key(&node.entity_type().id_props)
                .ok_or_else(|| {
                    UpsertGraphError::configuration(format!(
                        "stored {} has no id",
                        node.entity_type().name
                    ))
                })
        })
        .collect::<Result<Vec<IdKey>, _>>()?;
    Ok(RemoveRequest {
        scope,
        entity_type,
        ids,
    })
}

#[instrument(skip_all)]
pub(crate) async fn run<S>(
    ctx: &ActionContext<'_, S>,
    pair: &GraphPair,
    stats: &mut UpsertStats,
) -> Result<(), UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    let groups = groups(ctx, pair);
    let mut start = 0;
    while start < groups.len() {
        let depth = groups[start].depth;
        let end = groups[start..]
            .iter()
            .position(|group| group.depth != depth)
            .map_or(groups.len(), |offset| start + offset);
        let level = &groups[start..end];

        let mut requests = Vec::with_capacity(level.len());
        for group in level {
            requests.push((group.action, request_for(pair, group)?));
        }
        debug!(depth, groups = requests.len(), "upsert.delete.level");

        let calls = requests.len();
        let removed = dispatch(requests, ctx.concurrency(calls), |(action, request)| async move {
            let count = request.ids.len();
            match action {
                RemoveAction::Delete => ctx.storage.delete(request).await?,
                RemoveAction::Unrelate => ctx.storage.unrelate(request).await?,
            }
            Ok::<_, UpsertGraphError>((action, count))
        })
        .await?;

        for (action, count) in removed {
            match action {
                RemoveAction::Delete => stats.deleted += count,
                RemoveAction::Unrelate => stats.unrelated += count,
            }
        }
        stats.storage_calls += calls;
        start = end;
    }
    Ok(())
}
