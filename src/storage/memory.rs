//! In-memory reference storage.
//!
//! Rows live in per-type tables behind a mutex. Every successful call is
//! recorded so tests can assert on exactly what reconciliation issued, and
//! faults can be armed per operation to exercise failure paths.

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::errors::{StorageError, UpsertGraphError};
use crate::graph::ModelGraph;
use crate::model::{EntityType, IdKey, Relation, RelationKind};

use super::{
    GraphFetcher, GraphStorage, InsertRequest, JoinRowRequest, RemoveRequest, Row, RowSource,
    UpdateMode, UpdateRequest, WriteScope, columns_hold, fetch_current_graph, key_values,
    keys_match, row_from_json, row_has_id,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Insert,
    InsertJoinRows,
    Update,
    Delete,
    Unrelate,
}

/// A storage call that completed.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageCall {
    Insert {
        entity_type: String,
        rows: usize,
    },
    InsertJoinRows {
        table: String,
        rows: usize,
    },
    Update {
        entity_type: String,
        mode: UpdateMode,
        id: IdKey,
        columns: Vec<String>,
        related: bool,
    },
    Delete {
        entity_type: String,
        ids: Vec<IdKey>,
    },
    Unrelate {
        entity_type: String,
        relation: String,
        ids: Vec<IdKey>,
    },
}

impl StorageCall {
    pub fn op(&self) -> StorageOp {
        match self {
            StorageCall::Insert { .. } => StorageOp::Insert,
            StorageCall::InsertJoinRows { .. } => StorageOp::InsertJoinRows,
            StorageCall::Update { .. } => StorageOp::Update,
            StorageCall::Delete { .. } => StorageOp::Delete,
            StorageCall::Unrelate { .. } => StorageOp::Unrelate,
        }
    }
}

struct FaultEntry {
    skip: usize,
    remaining: usize,
}

#[derive(Default)]
struct MemoryState {
    tables: AHashMap<String, Vec<Row>>,
    join_tables: AHashMap<String, Vec<Row>>,
    sequences: AHashMap<String, i64>,
    calls: Vec<StorageCall>,
    attempts: AHashMap<StorageOp, usize>,
    faults: AHashMap<StorageOp, FaultEntry>,
}

impl MemoryState {
    /// Counts the attempt and fails it when a fault is armed for `op`.
    fn check_fault(&mut self, op: StorageOp) -> Result<(), StorageError> {
        *self.attempts.entry(op).or_insert(0) += 1;
        if let Some(entry) = self.faults.get_mut(&op) {
            if entry.skip > 0 {
                entry.skip -= 1;
                return Ok(());
            }
            if entry.remaining > 0 {
                entry.remaining -= 1;
                if entry.remaining == 0 {
                    self.faults.remove(&op);
                }
                return Err(StorageError::fault_injection(format!("{op:?}")));
            }
        }
        Ok(())
    }

    fn bump_sequence(&mut self, table: &str, id: &Value) {
        if let Some(id) = id.as_i64() {
            let seq = self.sequences.entry(table.to_string()).or_insert(0);
            *seq = (*seq).max(id);
        }
    }

    fn next_id(&mut self, table: &str) -> i64 {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn table(&self, name: &str) -> &[Row] {
        match self.tables.get(name) {
            Some(rows) => rows,
            None => &[],
        }
    }

    fn find(&self, entity_type: &EntityType, id: &IdKey) -> Option<&Row> {
        self.table(&entity_type.name)
            .iter()
            .find(|row| row_has_id(row, &entity_type.id_props, id))
    }

    fn find_mut(&mut self, entity_type: &EntityType, id: &IdKey) -> Option<&mut Row> {
        self.tables
            .get_mut(&entity_type.name)?
            .iter_mut()
            .find(|row| row_has_id(row, &entity_type.id_props, id))
    }

    fn owner_row(&self, scope: &WriteScope) -> Result<Option<Row>, StorageError> {
        match scope {
            WriteScope::Root => Ok(None),
            WriteScope::Related {
                owner_type,
                owner_id,
                ..
            } => self.find(owner_type, owner_id).cloned().map(Some).ok_or_else(|| {
                StorageError::not_found(format!("{}({owner_id})", owner_type.name))
            }),
        }
    }

    /// Removes the join rows linking `owner` and `related` through `relation`.
    fn remove_links(
        &mut self,
        relation: &Relation,
        owner: &Row,
        related: &Row,
    ) -> Result<(), StorageError> {
        let Some(join) = relation.join_table() else {
            return Ok(());
        };
        let owner_keys = key_values(owner, &relation.owner_props, &relation.owner_type)?;
        let related_keys = key_values(related, &relation.related_props, &relation.related_type)?;
        if let Some(rows) = self.join_tables.get_mut(&join.table) {
            rows.retain(|link| {
                !(columns_hold(link, &join.owner_columns, &owner_keys)
                    && columns_hold(link, &join.related_columns, &related_keys))
            });
        }
        Ok(())
    }
}

/// Storage kept entirely in memory.
///
/// Single-column integer keys are generated from a per-type sequence; other
/// keys must be supplied by the caller.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    batch_limit: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of rows accepted by one insert call.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    /// Stores a row directly, outside of the call log.
    pub fn seed(&self, entity_type: &EntityType, row: Value) -> Result<(), StorageError> {
        let row = row_from_json(row)?;
        let mut state = self.state.lock();
        if let [id_prop] = entity_type.id_props.as_slice()
            && let Some(id) = row.get(id_prop)
        {
            state.bump_sequence(&entity_type.name, id);
        }
        state
            .tables
            .entry(entity_type.name.clone())
            .or_default()
            .push(row);
        Ok(())
    }

    pub fn seed_join_row(&self, table: &str, row: Value) -> Result<(), StorageError> {
        let row = row_from_json(row)?;
        self.state
            .lock()
            .join_tables
            .entry(table.to_string())
            .or_default()
            .push(row);
        Ok(())
    }

    pub fn rows(&self, entity_type: &str) -> Vec<Row> {
        self.state.lock().table(entity_type).to_vec()
    }

    pub fn find(&self, entity_type: &EntityType, id: &IdKey) -> Option<Row> {
        self.state.lock().find(entity_type, id).cloned()
    }

    pub fn join_rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .join_tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.state.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<StorageCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Calls of `op` that were started, including failed ones.
    pub fn attempts(&self, op: StorageOp) -> usize {
        self.state.lock().attempts.get(&op).copied().unwrap_or(0)
    }

    /// Fails the next `failures` calls of `op`.
    pub fn configure_fault(&self, op: StorageOp, failures: usize) {
        self.configure_fault_after(op, 0, failures);
    }

    /// Lets `skip` calls of `op` through, then fails the next `failures`.
    pub fn configure_fault_after(&self, op: StorageOp, skip: usize, failures: usize) {
        let mut state = self.state.lock();
        if failures == 0 {
            state.faults.remove(&op);
        } else {
            state.faults.insert(
                op,
                FaultEntry {
                    skip,
                    remaining: failures,
                },
            );
        }
    }

    pub fn reset_faults(&self) {
        self.state.lock().faults.clear();
    }
}

#[async_trait]
impl GraphStorage for MemoryStorage {
    fn max_batch_size(&self) -> Option<usize> {
        self.batch_limit
    }

    async fn insert(&self, request: InsertRequest) -> Result<Vec<Row>, StorageError> {
        let entity_type = &request.entity_type;
        let table = entity_type.name.as_str();
        let mut state = self.state.lock();
        state.check_fault(StorageOp::Insert)?;
        if let Some(limit) = self.batch_limit
            && request.rows.len() > limit
        {
            return Err(StorageError::invalid_input(format!(
                "insert of {} rows exceeds the limit of {limit}",
                request.rows.len()
            )));
        }

        let count = request.rows.len();
        let mut staged: Vec<Row> = Vec::with_capacity(count);
        let mut generated = Vec::with_capacity(count);
        for mut row in request.rows {
            let mut produced = Row::new();
            let id = match IdKey::from_row(&row, &entity_type.id_props) {
                Some(id) => {
                    let taken = state.find(entity_type, &id).is_some()
                        || staged
                            .iter()
                            .any(|other| row_has_id(other, &entity_type.id_props, &id));
                    if taken {
                        return Err(StorageError::query(format!(
                            "duplicate key {table}({id})"
                        )));
                    }
                    id
                }
                None => {
                    let [id_prop] = entity_type.id_props.as_slice() else {
                        return Err(StorageError::invalid_input(format!(
                            "{table} rows need explicit values for a composite key"
                        )));
                    };
                    let next = json!(state.next_id(table));
                    row.insert(id_prop.clone(), next.clone());
                    produced.insert(id_prop.clone(), next.clone());
                    IdKey::single(next)
                }
            };
            if let [single] = id.values() {
                state.bump_sequence(table, single);
            }
            staged.push(row);
            generated.push(produced);
        }

        state.tables.entry(table.to_string()).or_default().extend(staged);
        state.calls.push(StorageCall::Insert {
            entity_type: table.to_string(),
            rows: count,
        });
        Ok(generated)
    }

    async fn insert_join_rows(&self, request: JoinRowRequest) -> Result<(), StorageError> {
        let Some(join) = request.relation.join_table() else {
            return Err(StorageError::invalid_input(format!(
                "relation {} has no join table",
                request.relation.name
            )));
        };
        let mut state = self.state.lock();
        state.check_fault(StorageOp::InsertJoinRows)?;
        let count = request.rows.len();
        state
            .join_tables
            .entry(join.table.clone())
            .or_default()
            .extend(request.rows);
        state.calls.push(StorageCall::InsertJoinRows {
            table: join.table.clone(),
            rows: count,
        });
        Ok(())
    }

    async fn update(&self, request: UpdateRequest) -> Result<(), StorageError> {
        let UpdateRequest {
            scope,
            entity_type,
            mode,
            id,
            mut row,
        } = request;
        let mut state = self.state.lock();
        state.check_fault(StorageOp::Update)?;
        let columns: Vec<String> = row.keys().cloned().collect();

        // Join-table extras live on the link, not on the related row.
        if let WriteScope::Related { relation, .. } = &scope
            && let RelationKind::ManyToMany(join) = &relation.kind
            && !join.extras.is_empty()
        {
            let extras: Row = join
                .extras
                .iter()
                .filter_map(|extra| row.remove(extra).map(|value| (extra.clone(), value)))
                .collect();
            if !extras.is_empty() {
                let owner = state.owner_row(&scope)?.unwrap_or_default();
                let related = state.find(&entity_type, &id).cloned().ok_or_else(|| {
                    StorageError::not_found(format!("{}({id})", entity_type.name))
                })?;
                let owner_keys = key_values(&owner, &relation.owner_props, &relation.owner_type)?;
                let related_keys =
                    key_values(&related, &relation.related_props, &relation.related_type)?;
                if let Some(links) = state.join_tables.get_mut(&join.table) {
                    for link in links.iter_mut().filter(|link| {
                        columns_hold(link, &join.owner_columns, &owner_keys)
                            && columns_hold(link, &join.related_columns, &related_keys)
                    }) {
                        link.extend(extras.clone());
                    }
                }
            }
        }

        let target = state
            .find_mut(&entity_type, &id)
            .ok_or_else(|| StorageError::not_found(format!("{}({id})", entity_type.name)))?;
        if mode == UpdateMode::Update {
            target.retain(|column, _| entity_type.is_id_prop(column));
        }
        target.extend(row);
        state.calls.push(StorageCall::Update {
            entity_type: entity_type.name.clone(),
            mode,
            id,
            columns,
            related: matches!(scope, WriteScope::Related { .. }),
        });
        Ok(())
    }

    async fn delete(&self, request: RemoveRequest) -> Result<(), StorageError> {
        let RemoveRequest {
            scope,
            entity_type,
            ids,
        } = request;
        let mut state = self.state.lock();
        state.check_fault(StorageOp::Delete)?;
        let owner = state.owner_row(&scope)?;
        for id in &ids {
            let Some(row) = state.find(&entity_type, id).cloned() else {
                continue;
            };
            if let (Some(relation), Some(owner)) = (scope.relation(), owner.as_ref()) {
                state.remove_links(relation, owner, &row)?;
            }
            if let Some(rows) = state.tables.get_mut(&entity_type.name) {
                rows.retain(|stored| !row_has_id(stored, &entity_type.id_props, id));
            }
        }
        state.calls.push(StorageCall::Delete {
            entity_type: entity_type.name.clone(),
            ids,
        });
        Ok(())
    }

    async fn unrelate(&self, request: RemoveRequest) -> Result<(), StorageError> {
        let RemoveRequest {
            scope,
            entity_type,
            ids,
        } = request;
        let mut state = self.state.lock();
        state.check_fault(StorageOp::Unrelate)?;
        let (Some(relation), Some(owner)) = (scope.relation().cloned(), state.owner_row(&scope)?)
        else {
            return Err(StorageError::invalid_input(format!(
                "unrelate of {} needs an owning relation",
                entity_type.name
            )));
        };

        match &relation.kind {
            RelationKind::HasMany => {
                for id in &ids {
                    if let Some(row) = state.find_mut(&entity_type, id) {
                        for prop in relation.related_props.props() {
                            row.insert(prop.clone(), Value::Null);
                        }
                    }
                }
            }
            RelationKind::BelongsToOne => {
                if let WriteScope::Related {
                    owner_type,
                    owner_id,
                    ..
                } = &scope
                    && let Some(row) = state.find_mut(owner_type, owner_id)
                {
                    for prop in relation.owner_props.props() {
                        row.insert(prop.clone(), Value::Null);
                    }
                }
            }
            RelationKind::ManyToMany(_) => {
                for id in &ids {
                    if let Some(row) = state.find(&entity_type, id).cloned() {
                        state.remove_links(&relation, &owner, &row)?;
                    }
                }
            }
        }

        state.calls.push(StorageCall::Unrelate {
            entity_type: entity_type.name.clone(),
            relation: relation.name.clone(),
            ids,
        });
        Ok(())
    }
}

#[async_trait]
impl RowSource for MemoryStorage {
    async fn find_by_id(
        &self,
        entity_type: &EntityType,
        id: &IdKey,
    ) -> Result<Option<Row>, StorageError> {
        Ok(self.find(entity_type, id))
    }

    async fn find_related(&self, relation: &Relation, owner: &Row) -> Result<Vec<Row>, StorageError> {
        let state = self.state.lock();
        let related = state.table(&relation.related_type);
        let Some(join) = relation.join_table() else {
            return Ok(related
                .iter()
                .filter(|row| {
                    keys_match(
                        owner,
                        relation.owner_props.props(),
                        row,
                        relation.related_props.props(),
                    )
                })
                .cloned()
                .collect());
        };

        let links = state.join_tables.get(&join.table).map_or(&[][..], Vec::as_slice);
        let mut rows = Vec::new();
        for link in links
            .iter()
            .filter(|link| keys_match(owner, relation.owner_props.props(), link, &join.owner_columns))
        {
            for row in related.iter().filter(|row| {
                keys_match(link, &join.related_columns, row, relation.related_props.props())
            }) {
                let mut row = row.clone();
                for extra in &join.extras {
                    if let Some(value) = link.get(extra) {
                        row.insert(extra.clone(), value.clone());
                    }
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl GraphFetcher for MemoryStorage {
    async fn fetch_current(&self, desired: &ModelGraph) -> Result<ModelGraph, UpsertGraphError> {
        fetch_current_graph(self, desired).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::PropertyList;

    fn item_type() -> Arc<EntityType> {
        Arc::new(EntityType::new("Item"))
    }

    fn insert(rows: Vec<Value>) -> InsertRequest {
        InsertRequest {
            entity_type: item_type(),
            rows: rows.into_iter().map(|r| row_from_json(r).unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn test_insert_generates_ids_after_seeded_rows() {
        let storage = MemoryStorage::new();
        storage.seed(&item_type(), json!({"id": 10})).unwrap();
        let generated = storage
            .insert(insert(vec![json!({"name": "a"}), json!({"id": 3})]))
            .await
            .unwrap();
        assert_eq!(Value::Object(generated[0].clone()), json!({"id": 11}));
        assert!(generated[1].is_empty());
        assert_eq!(storage.rows("Item").len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejects_whole_call() {
        let storage = MemoryStorage::new();
        storage.seed(&item_type(), json!({"id": 1})).unwrap();
        let err = storage
            .insert(insert(vec![json!({"id": 2}), json!({"id": 1})]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QueryError(_)));
        assert_eq!(storage.rows("Item").len(), 1);
    }

    #[tokio::test]
    async fn test_fault_after_skip() {
        let storage = MemoryStorage::new();
        storage.configure_fault_after(StorageOp::Insert, 1, 1);
        assert!(storage.insert(insert(vec![json!({})])).await.is_ok());
        assert!(matches!(
            storage.insert(insert(vec![json!({})])).await,
            Err(StorageError::FaultInjected(_))
        ));
        assert!(storage.insert(insert(vec![json!({})])).await.is_ok());
        assert_eq!(storage.attempts(StorageOp::Insert), 3);
        assert_eq!(storage.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unrelate_has_many_clears_foreign_key() {
        let storage = MemoryStorage::new();
        let order = Arc::new(EntityType::new("Order"));
        let relation = Arc::new(Relation::has_many(
            "items",
            "Order",
            "Item",
            PropertyList::new(["id"]),
            PropertyList::new(["order_id"]),
        ));
        storage.seed(&order, json!({"id": 1})).unwrap();
        storage
            .seed(&item_type(), json!({"id": 7, "order_id": 1}))
            .unwrap();
        storage
            .unrelate(RemoveRequest {
                scope: WriteScope::Related {
                    owner_type: order,
                    owner_id: IdKey::single(1),
                    relation,
                },
                entity_type: item_type(),
                ids: vec![IdKey::single(7)],
            })
            .await
            .unwrap();
        let row = storage.find(&item_type(), &IdKey::single(7)).unwrap();
        assert_eq!(row.get("order_id"), Some(&Value::Null));
    }
}
