//! SQLite-backed reference storage.
//!
//! Every entity row is stored as a JSON document keyed by entity type and
//! identifier. Each storage call runs inside its own savepoint so a failed
//! call leaves nothing behind, and callers can wrap a whole reconciliation
//! in [`SqliteStorage::begin`] / [`SqliteStorage::commit`].

mod schema;

pub use schema::SCHEMA_VERSION;

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};

use crate::errors::{StorageError, UpsertGraphError};
use crate::graph::ModelGraph;
use crate::model::{EntityType, IdKey, Relation, RelationKind};

use super::{
    GraphFetcher, GraphStorage, InsertRequest, JoinRowRequest, RemoveRequest, Row, RowSource,
    UpdateMode, UpdateRequest, WriteScope, columns_hold, fetch_current_graph, key_values,
    keys_match, row_from_json,
};

/// Savepoint around one storage call, rolled back unless released.
struct CallGuard<'a> {
    conn: &'a Connection,
    released: bool,
}

impl<'a> CallGuard<'a> {
    fn new(conn: &'a Connection) -> Result<Self, StorageError> {
        conn.execute("SAVEPOINT upsert_call", [])
            .map_err(|e| StorageError::transaction(e.to_string()))?;
        Ok(Self {
            conn,
            released: false,
        })
    }

    fn execute<F, R>(mut self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&Connection) -> Result<R, StorageError>,
    {
        let result = f(self.conn)?;
        self.conn
            .execute("RELEASE upsert_call", [])
            .map_err(|e| StorageError::transaction(e.to_string()))?;
        self.released = true;
        Ok(result)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.conn.execute("ROLLBACK TO upsert_call", []);
            let _ = self.conn.execute("RELEASE upsert_call", []);
        }
    }
}

fn encode(row: &Row) -> Result<String, StorageError> {
    serde_json::to_string(row).map_err(|e| StorageError::invalid_input(e.to_string()))
}

fn decode(text: &str) -> Result<Row, StorageError> {
    match serde_json::from_str(text) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(StorageError::query(format!(
            "stored row is not an object: {other}"
        ))),
        Err(e) => Err(StorageError::query(format!("stored row is not JSON: {e}"))),
    }
}

fn load(conn: &Connection, entity_type: &str, id: &IdKey) -> Result<Option<Row>, StorageError> {
    let text: Option<String> = conn
        .query_row(
            "SELECT data FROM upsert_rows WHERE entity_type=?1 AND row_key=?2",
            params![entity_type, id.index_key()],
            |row| row.get(0),
        )
        .optional()?;
    text.as_deref().map(decode).transpose()
}

fn store(conn: &Connection, entity_type: &str, id: &IdKey, row: &Row) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE upsert_rows SET data=?3 WHERE entity_type=?1 AND row_key=?2",
        params![entity_type, id.index_key(), encode(row)?],
    )?;
    Ok(())
}

fn scan(conn: &Connection, entity_type: &str) -> Result<Vec<Row>, StorageError> {
    let mut stmt =
        conn.prepare_cached("SELECT data FROM upsert_rows WHERE entity_type=?1 ORDER BY rowid")?;
    let texts = stmt
        .query_map(params![entity_type], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    texts.iter().map(|text| decode(text)).collect()
}

fn links(conn: &Connection, table: &str) -> Result<Vec<(i64, Row)>, StorageError> {
    let mut stmt = conn
        .prepare_cached("SELECT id, data FROM upsert_join_rows WHERE join_table=?1 ORDER BY id")?;
    let raw = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(id, text)| Ok((id, decode(&text)?)))
        .collect()
}

fn insert_link(conn: &Connection, table: &str, row: &Row) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO upsert_join_rows(join_table, data) VALUES(?1, ?2)",
        params![table, encode(row)?],
    )?;
    Ok(())
}

fn bump_sequence(conn: &Connection, entity_type: &str, id: &Value) -> Result<(), StorageError> {
    if let Some(id) = id.as_i64() {
        conn.execute(
            "INSERT INTO upsert_sequences(entity_type, value) VALUES(?1, ?2)
             ON CONFLICT(entity_type) DO UPDATE SET value = max(value, excluded.value)",
            params![entity_type, id],
        )?;
    }
    Ok(())
}

fn next_id(conn: &Connection, entity_type: &str) -> Result<i64, StorageError> {
    Ok(conn.query_row(
        "INSERT INTO upsert_sequences(entity_type, value) VALUES(?1, 1)
         ON CONFLICT(entity_type) DO UPDATE SET value = value + 1
         RETURNING value",
        params![entity_type],
        |row| row.get(0),
    )?)
}

/// Join rows of `relation` linking `owner` and `related`.
fn matching_links(
    conn: &Connection,
    relation: &Relation,
    owner: &Row,
    related: &Row,
) -> Result<Vec<(i64, Row)>, StorageError> {
    let Some(join) = relation.join_table() else {
        return Ok(Vec::new());
    };
    let owner_keys = key_values(owner, &relation.owner_props, &relation.owner_type)?;
    let related_keys = key_values(related, &relation.related_props, &relation.related_type)?;
    Ok(links(conn, &join.table)?
        .into_iter()
        .filter(|(_, link)| {
            columns_hold(link, &join.owner_columns, &owner_keys)
                && columns_hold(link, &join.related_columns, &related_keys)
        })
        .collect())
}

fn owner_row(conn: &Connection, scope: &WriteScope) -> Result<Option<Row>, StorageError> {
    match scope {
        WriteScope::Root => Ok(None),
        WriteScope::Related {
            owner_type,
            owner_id,
            ..
        } => load(conn, &owner_type.name, owner_id)?
            .map(Some)
            .ok_or_else(|| StorageError::not_found(format!("{}({owner_id})", owner_type.name))),
    }
}

/// Storage backed by a single SQLite connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    batch_limit: Option<usize>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        schema::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            batch_limit: None,
        })
    }

    /// Caps the number of rows accepted by one insert call.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = Some(limit);
        self
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        schema::read_schema_version(&self.conn.lock())
    }

    pub fn begin(&self) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("BEGIN IMMEDIATE", [])
            .map_err(|e| StorageError::transaction(e.to_string()))?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("COMMIT", [])
            .map_err(|e| StorageError::transaction(e.to_string()))?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StorageError> {
        self.conn
            .lock()
            .execute("ROLLBACK", [])
            .map_err(|e| StorageError::transaction(e.to_string()))?;
        Ok(())
    }

    /// Stores a row directly, bypassing reconciliation.
    pub fn seed(&self, entity_type: &EntityType, row: Value) -> Result<(), StorageError> {
        let row = row_from_json(row)?;
        let id = IdKey::from_row(&row, &entity_type.id_props).ok_or_else(|| {
            StorageError::invalid_input(format!("seeded {} row has no id", entity_type.name))
        })?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO upsert_rows(entity_type, row_key, data) VALUES(?1, ?2, ?3)",
            params![entity_type.name, id.index_key(), encode(&row)?],
        )?;
        if let [single] = id.values() {
            bump_sequence(&conn, &entity_type.name, single)?;
        }
        Ok(())
    }

    pub fn seed_join_row(&self, table: &str, row: Value) -> Result<(), StorageError> {
        insert_link(&self.conn.lock(), table, &row_from_json(row)?)
    }

    pub fn rows(&self, entity_type: &str) -> Result<Vec<Row>, StorageError> {
        scan(&self.conn.lock(), entity_type)
    }

    pub fn find(&self, entity_type: &EntityType, id: &IdKey) -> Result<Option<Row>, StorageError> {
        load(&self.conn.lock(), &entity_type.name, id)
    }

    pub fn join_rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        Ok(links(&self.conn.lock(), table)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }
}

#[async_trait]
impl GraphStorage for SqliteStorage {
    fn max_batch_size(&self) -> Option<usize> {
        self.batch_limit
    }

    async fn insert(&self, request: InsertRequest) -> Result<Vec<Row>, StorageError> {
        if let Some(limit) = self.batch_limit
            && request.rows.len() > limit
        {
            return Err(StorageError::invalid_input(format!(
                "insert of {} rows exceeds the limit of {limit}",
                request.rows.len()
            )));
        }
        let entity_type = &request.entity_type;
        let table = entity_type.name.as_str();
        let conn = self.conn.lock();
        CallGuard::new(&conn)?.execute(|conn| {
            let mut generated = Vec::with_capacity(request.rows.len());
            for row in &request.rows {
                let mut row = row.clone();
                let mut produced = Row::new();
                let id = match IdKey::from_row(&row, &entity_type.id_props) {
                    Some(id) => id,
                    None => {
                        let [id_prop] = entity_type.id_props.as_slice() else {
                            return Err(StorageError::invalid_input(format!(
                                "{table} rows need explicit values for a composite key"
                            )));
                        };
                        let next = json!(next_id(conn, table)?);
                        row.insert(id_prop.clone(), next.clone());
                        produced.insert(id_prop.clone(), next.clone());
                        IdKey::single(next)
                    }
                };
                if load(conn, table, &id)?.is_some() {
                    return Err(StorageError::query(format!("duplicate key {table}({id})")));
                }
                conn.execute(
                    "INSERT INTO upsert_rows(entity_type, row_key, data) VALUES(?1, ?2, ?3)",
                    params![table, id.index_key(), encode(&row)?],
                )?;
                if let [single] = id.values() {
                    bump_sequence(conn, table, single)?;
                }
                generated.push(produced);
            }
            Ok(generated)
        })
    }

    async fn insert_join_rows(&self, request: JoinRowRequest) -> Result<(), StorageError> {
        let Some(join) = request.relation.join_table() else {
            return Err(StorageError::invalid_input(format!(
                "relation {} has no join table",
                request.relation.name
            )));
        };
        let conn = self.conn.lock();
        CallGuard::new(&conn)?.execute(|conn| {
            for row in &request.rows {
                insert_link(conn, &join.table, row)?;
            }
            Ok(())
        })
    }

    async fn update(&self, request: UpdateRequest) -> Result<(), StorageError> {
        let UpdateRequest {
            scope,
            entity_type,
            mode,
            id,
            mut row,
        } = request;
        let conn = self.conn.lock();
        CallGuard::new(&conn)?.execute(|conn| {
            let mut stored = load(conn, &entity_type.name, &id)?
                .ok_or_else(|| StorageError::not_found(format!("{}({id})", entity_type.name)))?;

            if let WriteScope::Related { relation, .. } = &scope
                && let RelationKind::ManyToMany(join) = &relation.kind
            {
                let extras: Row = join
                    .extras
                    .iter()
                    .filter_map(|extra| row.remove(extra).map(|value| (extra.clone(), value)))
                    .collect();
                if !extras.is_empty() {
                    let owner = owner_row(conn, &scope)?.unwrap_or_default();
                    for (link_id, mut link) in matching_links(conn, relation, &owner, &stored)? {
                        link.extend(extras.clone());
                        conn.execute(
                            "UPDATE upsert_join_rows SET data=?2 WHERE id=?1",
                            params![link_id, encode(&link)?],
                        )?;
                    }
                }
            }

            if mode == UpdateMode::Update {
                stored.retain(|column, _| entity_type.is_id_prop(column));
            }
            stored.extend(row);
            store(conn, &entity_type.name, &id, &stored)
        })
    }

    async fn delete(&self, request: RemoveRequest) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        CallGuard::new(&conn)?.execute(|conn| {
            let owner = owner_row(conn, &request.scope)?;
            for id in &request.ids {
                let Some(row) = load(conn, &request.entity_type.name, id)? else {
                    continue;
                };
                if let (Some(relation), Some(owner)) = (request.scope.relation(), owner.as_ref()) {
                    for (link_id, _) in matching_links(conn, relation, owner, &row)? {
                        conn.execute("DELETE FROM upsert_join_rows WHERE id=?1", [link_id])?;
                    }
                }
                conn.execute(
                    "DELETE FROM upsert_rows WHERE entity_type=?1 AND row_key=?2",
                    params![request.entity_type.name, id.index_key()],
                )?;
            }
            Ok(())
        })
    }

    async fn unrelate(&self, request: RemoveRequest) -> Result<(), StorageError> {
        let RemoveRequest {
            scope,
            entity_type,
            ids,
        } = request;
        let WriteScope::Related {
            owner_type,
            owner_id,
            relation,
        } = &scope
        else {
            return Err(StorageError::invalid_input(format!(
                "unrelate of {} needs an owning relation",
                entity_type.name
            )));
        };
        let conn = self.conn.lock();
        CallGuard::new(&conn)?.execute(|conn| {
            let mut owner = owner_row(conn, &scope)?.unwrap_or_default();
            match &relation.kind {
                RelationKind::HasMany => {
                    for id in &ids {
                        if let Some(mut row) = load(conn, &entity_type.name, id)? {
                            for prop in relation.related_props.props() {
                                row.insert(prop.clone(), Value::Null);
                            }
                            store(conn, &entity_type.name, id, &row)?;
                        }
                    }
                }
                RelationKind::BelongsToOne => {
                    for prop in relation.owner_props.props() {
                        owner.insert(prop.clone(), Value::Null);
                    }
                    store(conn, &owner_type.name, owner_id, &owner)?;
                }
                RelationKind::ManyToMany(_) => {
                    for id in &ids {
                        let Some(row) = load(conn, &entity_type.name, id)? else {
                            continue;
                        };
                        for (link_id, _) in matching_links(conn, relation, &owner, &row)? {
                            conn.execute("DELETE FROM upsert_join_rows WHERE id=?1", [link_id])?;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl RowSource for SqliteStorage {
    async fn find_by_id(
        &self,
        entity_type: &EntityType,
        id: &IdKey,
    ) -> Result<Option<Row>, StorageError> {
        self.find(entity_type, id)
    }

    async fn find_related(&self, relation: &Relation, owner: &Row) -> Result<Vec<Row>, StorageError> {
        let conn = self.conn.lock();
        let related = scan(&conn, &relation.related_type)?;
        let Some(join) = relation.join_table() else {
            return Ok(related
                .into_iter()
                .filter(|row| {
                    keys_match(
                        owner,
                        relation.owner_props.props(),
                        row,
                        relation.related_props.props(),
                    )
                })
                .collect());
        };

        let mut rows = Vec::new();
        for (_, link) in links(&conn, &join.table)? {
            if !keys_match(owner, relation.owner_props.props(), &link, &join.owner_columns) {
                continue;
            }
            for row in related.iter().filter(|row| {
                keys_match(&link, &join.related_columns, row, relation.related_props.props())
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
impl GraphFetcher for SqliteStorage {
    async fn fetch_current(&self, desired: &ModelGraph) -> Result<ModelGraph, UpsertGraphError> {
        fetch_current_graph(self, desired).await
    }
}
