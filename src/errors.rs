use thiserror::Error;

/// Error type for graph reconciliation.
///
/// `Configuration` and `DependencyCycle` are raised before any write is issued.
/// `Validation` and `Storage` abort the phase that is running; the caller is
/// expected to roll back the surrounding transaction.
#[derive(Debug, Error)]
pub enum UpsertGraphError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),
    #[error("validation error at {data_path}: {message}")]
    Validation { data_path: String, message: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl UpsertGraphError {
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        UpsertGraphError::Configuration(msg.into())
    }

    pub fn dependency_cycle<T: Into<String>>(msg: T) -> Self {
        UpsertGraphError::DependencyCycle(msg.into())
    }

    pub fn validation<P: Into<String>, M: Into<String>>(data_path: P, message: M) -> Self {
        UpsertGraphError::Validation {
            data_path: data_path.into(),
            message: message.into(),
        }
    }
}

/// Error type for the storage execution surface.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("query error: {0}")]
    QueryError(String),
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("fault injected: {0}")]
    FaultInjected(String),
    #[error("transaction error: {0}")]
    TransactionError(String),
    #[cfg(feature = "sqlite-backend")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn query<T: Into<String>>(msg: T) -> Self {
        StorageError::QueryError(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        StorageError::NotFound(msg.into())
    }

    pub fn invalid_input<T: Into<String>>(msg: T) -> Self {
        StorageError::InvalidInput(msg.into())
    }

    pub fn fault_injection<T: Into<String>>(msg: T) -> Self {
        StorageError::FaultInjected(msg.into())
    }

    pub fn transaction<T: Into<String>>(msg: T) -> Self {
        StorageError::TransactionError(msg.into())
    }
}
