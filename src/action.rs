//! Phase bookkeeping and bounded fan-out of storage calls.
//!
//! A phase is an ordered list of actions. Inside one action the storage
//! calls are independent: they are dispatched concurrently, at most
//! `concurrency` at a time, and their results come back in request order so
//! they can be applied to the graph deterministically.

use std::fmt;
use std::future::Future;

use futures_util::{StreamExt, TryStreamExt, stream};

use crate::config::ExecutionConfig;
use crate::policy::GraphOptions;
use crate::storage::GraphStorage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Delete,
    Insert,
    Patch,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Delete => "delete",
            Phase::Insert => "insert",
            Phase::Patch => "patch",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every phase needs besides the graphs.
pub(crate) struct ActionContext<'a, S: ?Sized> {
    pub(crate) storage: &'a S,
    pub(crate) options: &'a GraphOptions,
    pub(crate) config: &'a ExecutionConfig,
}

impl<S: GraphStorage + ?Sized> ActionContext<'_, S> {
    /// Rows per insert call.
    pub(crate) fn batch_size(&self) -> usize {
        self.config.effective_batch_size(self.storage.max_batch_size())
    }

    pub(crate) fn concurrency(&self, pending: usize) -> usize {
        self.config.effective_concurrency(pending)
    }
}

/// Runs `call` for every request with at most `concurrency` calls in flight.
///
/// Results keep request order. The first error stops the fan-out: calls not
/// yet started are never started and calls in flight are dropped.
pub(crate) async fn dispatch<T, R, E, F, Fut>(
    requests: Vec<T>,
    concurrency: usize,
    call: F,
) -> Result<Vec<R>, E>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    stream::iter(requests)
        .map(call)
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}
