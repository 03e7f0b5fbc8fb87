//! Join-table rows for many-to-many children, written after every batch so
//! both sides carry their final keys.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::action::{ActionContext, dispatch};
use crate::errors::UpsertGraphError;
use crate::graph::{GraphPair, NodeId};
use crate::model::{Entity, JoinTable, PropertyList, Relation};
use crate::storage::{GraphStorage, JoinRowRequest, Row};
use crate::upsert::UpsertStats;

use super::dependency::describe_path;

/// Desired nodes that need a join row linking them to their parent.
pub(crate) fn candidates<S>(ctx: &ActionContext<'_, S>, pair: &GraphPair) -> Vec<NodeId>
where
    S: GraphStorage + ?Sized,
{
    pair.desired
        .node_ids()
        .filter(|&id| {
            let node = pair.desired.node(id);
            let many_to_many = node
                .parent_edge()
                .and_then(|edge| pair.desired.edge(edge).relation())
                .is_some_and(|relation| relation.join_table().is_some());
            many_to_many
                && pair.current_of(id).is_none()
                && (node.flags().inserted || ctx.options.should_insert_or_relate(pair, id))
        })
        .collect()
}

pub(crate) async fn run<S>(
    ctx: &ActionContext<'_, S>,
    pair: &GraphPair,
    stats: &mut UpsertStats,
) -> Result<(), UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    let nodes = candidates(ctx, pair);
    if nodes.is_empty() {
        return Ok(());
    }

    // One request per join table, in first-appearance order.
    let mut requests: Vec<JoinRowRequest> = Vec::new();
    for id in nodes {
        let node = pair.desired.node(id);
        let (Some(parent), Some(edge)) = (node.parent_node(), node.parent_edge()) else {
            continue;
        };
        let Some(relation) = pair.desired.edge(edge).relation() else {
            continue;
        };
        let Some(join) = relation.join_table() else {
            continue;
        };
        let row = join_row(
            relation,
            join,
            pair.desired.node(parent).entity(),
            node.entity(),
        )
        .map_err(|message| {
            UpsertGraphError::configuration(format!(
                "{message} at {}",
                describe_path(node.data_path())
            ))
        })?;

        match requests
            .iter_mut()
            .find(|request| request.relation.join_table().is_some_and(|j| j.table == join.table))
        {
            Some(request) => request.rows.push(row),
            None => requests.push(JoinRowRequest {
                relation: Arc::clone(relation),
                rows: vec![row],
            }),
        }
    }

    for request in &requests {
        debug!(
            relation = %request.relation.name,
            rows = request.rows.len(),
            "upsert.insert.join_rows"
        );
    }
    let calls = requests.len();
    dispatch(requests, ctx.concurrency(calls), |request| {
        ctx.storage.insert_join_rows(request)
    })
    .await?;
    stats.storage_calls += calls;
    Ok(())
}

fn join_row(
    relation: &Relation,
    join: &JoinTable,
    owner: &Entity,
    related: &Entity,
) -> Result<Row, String> {
    let mut row = Row::new();
    copy_keys(&mut row, &join.owner_columns, &relation.owner_props, owner, "owner")?;
    copy_keys(
        &mut row,
        &join.related_columns,
        &relation.related_props,
        related,
        "related",
    )?;
    for extra in &join.extras {
        if let Some(value) = related.get(extra) {
            row.insert(extra.clone(), value.clone());
        }
    }
    Ok(row)
}

fn copy_keys(
    row: &mut Row,
    columns: &[String],
    props: &PropertyList,
    entity: &Entity,
    side: &str,
) -> Result<(), String> {
    if columns.len() != props.size() {
        return Err(format!(
            "join table has {} {side} columns for {} {side} properties",
            columns.len(),
            props.size()
        ));
    }
    for (index, column) in columns.iter().enumerate() {
        match props.get_prop(entity, index) {
            None | Some(Value::Null) => {
                return Err(format!("join row is missing {side} key {}", props.prop(index)));
            }
            Some(value) => {
                row.insert(column.clone(), value.clone());
            }
        }
    }
    Ok(())
}
