use thiserror::Error;

/// Failures raised by a [`RecordStorage`](crate::storage::RecordStorage) backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record for {person_id}: {reason}")]
    Corrupt { person_id: String, reason: String },
    #[error("storage lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no record registered for {0}")]
    NotFound(String),
    #[error("no face detected in the supplied image")]
    ExtractionFailed,
    #[error("embedding extractor: {0}")]
    Extractor(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("write for {0} was not persisted")]
    PersistenceFailure(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl RegistryError {
    /// True when the failure means a write never reached the backing store.
    /// Read failures (corrupt rows, poisoned locks) are not included.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::PersistenceFailure(_))
    }
}
