use rusqlite::{Connection, OptionalExtension};

use crate::errors::StorageError;

pub const BASE_SCHEMA_VERSION: i64 = 1;

struct MigrationStep {
    target_version: i64,
    statements: &'static [&'static str],
}

const MIGRATION_STEPS: &[MigrationStep] = &[MigrationStep {
    target_version: 2,
    statements: &[
        "CREATE INDEX IF NOT EXISTS idx_join_rows_table ON upsert_join_rows(join_table)",
    ],
}];

pub const SCHEMA_VERSION: i64 = BASE_SCHEMA_VERSION + MIGRATION_STEPS.len() as i64;

pub fn ensure_schema(conn: &Connection) -> Result<(), StorageError> {
    ensure_base_schema(conn)?;
    ensure_meta(conn)?;
    run_pending_migrations(conn)?;
    Ok(())
}

fn ensure_base_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS upsert_rows (
            entity_type TEXT NOT NULL,
            row_key     TEXT NOT NULL,
            data        TEXT NOT NULL,
            PRIMARY KEY (entity_type, row_key)
        );
        CREATE TABLE IF NOT EXISTS upsert_join_rows (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            join_table TEXT NOT NULL,
            data       TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS upsert_sequences (
            entity_type TEXT PRIMARY KEY,
            value       INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS upsert_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StorageError::query(e.to_string()))
}

pub fn read_schema_version(conn: &Connection) -> Result<i64, StorageError> {
    conn.query_row(
        "SELECT schema_version FROM upsert_meta WHERE id=1",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::query(e.to_string()))
}

fn run_pending_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current = read_schema_version(conn)?;
    let pending: Vec<&MigrationStep> = MIGRATION_STEPS
        .iter()
        .filter(|step| step.target_version > current)
        .collect();
    let Some(last) = pending.last() else {
        return Ok(());
    };
    let target = last.target_version;

    conn.execute("BEGIN IMMEDIATE", [])
        .map_err(|e| StorageError::transaction(e.to_string()))?;
    let result: Result<(), StorageError> = (|| {
        for sql in pending.iter().flat_map(|step| step.statements.iter().copied()) {
            conn.execute(sql, [])
                .map_err(|e| StorageError::query(e.to_string()))?;
        }
        conn.execute(
            "UPDATE upsert_meta SET schema_version=?1 WHERE id=1",
            [target],
        )
        .map_err(|e| StorageError::query(e.to_string()))?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            conn.execute("COMMIT", [])
                .map_err(|e| StorageError::transaction(e.to_string()))?;
            Ok(())
        }
        Err(err) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(err)
        }
    }
}

fn ensure_meta(conn: &Connection) -> Result<(), StorageError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM upsert_meta WHERE id=1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StorageError::query(e.to_string()))?;
    match version {
        Some(existing) if existing > SCHEMA_VERSION => Err(StorageError::query(format!(
            "database schema version {existing} is newer than supported {SCHEMA_VERSION}"
        ))),
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT INTO upsert_meta(id, schema_version) VALUES(1, ?1)",
                [BASE_SCHEMA_VERSION],
            )
            .map_err(|e| StorageError::query(e.to_string()))?;
            Ok(())
        }
    }
}
