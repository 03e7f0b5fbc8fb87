//! Insert phase: dependency-ordered batches, then join rows.

mod action;
mod dependency;
mod join_row;

use tracing::{debug, instrument};

use crate::action::ActionContext;
use crate::errors::UpsertGraphError;
use crate::graph::{GraphPair, NodeId};
use crate::storage::GraphStorage;
use crate::upsert::UpsertStats;

pub(crate) use dependency::describe_path;
use dependency::{DependencyMap, schedule};

/// Insert order computed up front, before anything is written.
#[derive(Clone, Debug)]
pub(crate) struct InsertPlan {
    deps: DependencyMap,
    batches: Vec<Vec<NodeId>>,
}

impl InsertPlan {
    pub(crate) fn batches(&self) -> &[Vec<NodeId>] {
        &self.batches
    }
}

/// Fails with a dependency cycle when no insert order exists.
pub(crate) fn plan(pair: &GraphPair) -> Result<InsertPlan, UpsertGraphError> {
    let deps = DependencyMap::build(pair.desired());
    let batches = schedule(pair.desired(), &deps)?;
    Ok(InsertPlan { deps, batches })
}

#[instrument(skip_all, fields(batches = plan.batches.len()))]
pub(crate) async fn run<S>(
    ctx: &ActionContext<'_, S>,
    pair: &mut GraphPair,
    plan: &InsertPlan,
    stats: &mut UpsertStats,
) -> Result<(), UpsertGraphError>
where
    S: GraphStorage + ?Sized,
{
    for (index, batch) in plan.batches.iter().enumerate() {
        debug!(batch = index, nodes = batch.len(), "upsert.insert.batch");
        action::run_batch(ctx, pair, &plan.deps, batch, stats).await?;
    }
    join_row::run(ctx, pair, stats).await
}
