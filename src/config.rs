//! Reconciliation options and execution tuning.
//!
//! [`UpsertOptions`] carries the per-relation-path policy overrides that decide
//! what happens to each node. [`ExecutionConfig`] controls how the resulting
//! storage calls are chunked and dispatched.

use serde::{Deserialize, Serialize};

use crate::errors::UpsertGraphError;

/// A policy override that applies either to every node or only to nodes whose
/// relation path is listed.
///
/// Deserializes from `true`/`false` or from a list of relation paths.
///
/// # Examples
///
/// ```rust
/// use upsertgraph::OptionFlag;
///
/// let flag: OptionFlag = serde_json::from_str(r#"["items", "items.product"]"#).unwrap();
/// assert!(flag.applies_to("items.product"));
/// assert!(!flag.applies_to(""));
/// assert!(OptionFlag::from(true).applies_to("anything"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionFlag {
    All(bool),
    Paths(Vec<String>),
}

impl OptionFlag {
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OptionFlag::Paths(paths.into_iter().map(Into::into).collect())
    }

    pub fn applies_to(&self, relation_path: &str) -> bool {
        match self {
            OptionFlag::All(enabled) => *enabled,
            OptionFlag::Paths(paths) => paths.iter().any(|path| path == relation_path),
        }
    }
}

impl Default for OptionFlag {
    fn default() -> Self {
        OptionFlag::All(false)
    }
}

impl From<bool> for OptionFlag {
    fn from(enabled: bool) -> Self {
        OptionFlag::All(enabled)
    }
}

impl From<Vec<String>> for OptionFlag {
    fn from(paths: Vec<String>) -> Self {
        OptionFlag::Paths(paths)
    }
}

impl From<&[&str]> for OptionFlag {
    fn from(paths: &[&str]) -> Self {
        OptionFlag::paths(paths.iter().copied())
    }
}

/// Names of the policy overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GraphOption {
    NoInsert,
    NoUpdate,
    NoDelete,
    NoRelate,
    NoUnrelate,
    Update,
    Relate,
    Unrelate,
    InsertMissing,
}

/// Policy overrides for one reconciliation call.
///
/// By default nodes missing from storage are inserted, existing nodes are
/// patched and stored nodes missing from the desired graph are deleted.
///
/// # Examples
///
/// ```rust
/// use upsertgraph::{GraphOption, UpsertOptions};
///
/// let opts = UpsertOptions::from_json(r#"{"relate": true, "noDelete": ["items"]}"#).unwrap();
/// assert!(opts.flag(GraphOption::Relate).applies_to("items"));
/// assert!(opts.flag(GraphOption::NoDelete).applies_to("items"));
/// assert!(!opts.flag(GraphOption::NoDelete).applies_to(""));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpsertOptions {
    pub no_insert: OptionFlag,
    pub no_update: OptionFlag,
    pub no_delete: OptionFlag,
    pub no_relate: OptionFlag,
    pub no_unrelate: OptionFlag,
    /// Full overwrite instead of a partial patch.
    pub update: OptionFlag,
    /// Relate nodes missing from storage that carry an id instead of failing.
    pub relate: OptionFlag,
    /// Unrelate nodes missing from the desired graph instead of deleting them.
    pub unrelate: OptionFlag,
    /// Insert nodes that carry an id but do not exist yet.
    pub insert_missing: OptionFlag,
}

impl UpsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, UpsertGraphError> {
        serde_json::from_str(json)
            .map_err(|e| UpsertGraphError::configuration(format!("invalid upsert options: {e}")))
    }

    pub fn flag(&self, option: GraphOption) -> &OptionFlag {
        match option {
            GraphOption::NoInsert => &self.no_insert,
            GraphOption::NoUpdate => &self.no_update,
            GraphOption::NoDelete => &self.no_delete,
            GraphOption::NoRelate => &self.no_relate,
            GraphOption::NoUnrelate => &self.no_unrelate,
            GraphOption::Update => &self.update,
            GraphOption::Relate => &self.relate,
            GraphOption::Unrelate => &self.unrelate,
            GraphOption::InsertMissing => &self.insert_missing,
        }
    }

    /// Builder-style setter.
    pub fn with<F: Into<OptionFlag>>(mut self, option: GraphOption, flag: F) -> Self {
        let slot = match option {
            GraphOption::NoInsert => &mut self.no_insert,
            GraphOption::NoUpdate => &mut self.no_update,
            GraphOption::NoDelete => &mut self.no_delete,
            GraphOption::NoRelate => &mut self.no_relate,
            GraphOption::NoUnrelate => &mut self.no_unrelate,
            GraphOption::Update => &mut self.update,
            GraphOption::Relate => &mut self.relate,
            GraphOption::Unrelate => &mut self.unrelate,
            GraphOption::InsertMissing => &mut self.insert_missing,
        };
        *slot = flag.into();
        self
    }
}

/// Chunking and dispatch limits for storage calls.
///
/// # Default Configuration
///
/// ```rust
/// use upsertgraph::ExecutionConfig;
/// let config = ExecutionConfig::default();
/// assert_eq!(config.max_batch_size, 1000);
/// assert!(config.concurrency.is_none());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Maximum number of entities in one bulk insert call.
    ///
    /// **Default:** `1000`. The storage may lower it further through
    /// `GraphStorage::max_batch_size`.
    pub max_batch_size: usize,

    /// Maximum number of storage calls in flight within one batch.
    ///
    /// **Default:** `None` (unbounded, limited only by the storage itself).
    /// Large graphs can expand to hundreds of same-type chunks; bounding this
    /// keeps them from exhausting a connection pool.
    pub concurrency: Option<usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            concurrency: None,
        }
    }
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, UpsertGraphError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            UpsertGraphError::configuration(format!("invalid execution config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), UpsertGraphError> {
        if self.max_batch_size == 0 {
            return Err(UpsertGraphError::configuration(
                "max_batch_size must be at least 1",
            ));
        }
        if self.concurrency == Some(0) {
            return Err(UpsertGraphError::configuration(
                "concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    /// Chunk size after applying the storage's own bulk limit.
    pub fn effective_batch_size(&self, storage_limit: Option<usize>) -> usize {
        let size = match storage_limit {
            Some(limit) => self.max_batch_size.min(limit),
            None => self.max_batch_size,
        };
        size.max(1)
    }

    /// Number of calls allowed in flight for `pending` queued calls.
    pub fn effective_concurrency(&self, pending: usize) -> usize {
        self.concurrency.unwrap_or(pending).max(1)
    }
}
