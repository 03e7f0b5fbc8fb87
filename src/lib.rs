//! Graph upsert for entity stores.
//!
//! Reconciles a desired entity graph against the state persisted in a storage:
//! rows missing from storage are inserted in foreign-key order, existing rows
//! are patched with only the properties that changed, and stored rows missing
//! from the desired graph are deleted or unrelated.
//! Run Criterion benchmarks with `cargo bench` to inspect reports under `target/criterion`.

pub mod action;
pub mod config;
mod delete;
pub mod errors;
pub mod graph;
mod insert;
pub mod model;
mod patch;
pub mod policy;
pub mod reference;
pub mod storage;
pub mod upsert;

pub use crate::action::Phase;
pub use crate::config::{ExecutionConfig, GraphOption, OptionFlag, UpsertOptions};
pub use crate::errors::{StorageError, UpsertGraphError};
pub use crate::graph::{
    Edge, EdgeId, EdgeKind, GraphPair, InputShape, ModelGraph, Node, NodeFlags, NodeId, NodeKind,
    PropertyReference,
};
pub use crate::model::{
    Entity, EntityType, EntityValidator, IdKey, JoinTable, PropertyList, Relation, RelationDef,
    RelationHook, RelationKind, ValidationContext,
};
pub use crate::policy::GraphOptions;
pub use crate::reference::ReferenceMode;
#[cfg(feature = "sqlite-backend")]
pub use crate::storage::SqliteStorage;
pub use crate::storage::{
    GraphFetcher, GraphStorage, InsertRequest, JoinRowRequest, MemoryStorage, RemoveRequest,
    Row, RowSource, StorageCall, StorageOp, UpdateMode, UpdateRequest, WriteScope,
    fetch_current_graph,
};
pub use crate::upsert::{UpsertGraph, UpsertOutcome, UpsertStats, Upserted};
