use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Remote store error: {0}")]
    Remote(String),
    #[error("Remote document not found: {0}")]
    DocumentNotFound(String),
    #[error("Task aggregate missing for task: {0}")]
    TaskAggregateMissing(String),
    #[error("Remote store rejected write: {0}")]
    Rejected(String),
}

impl InfraError {
    pub fn lock_poisoned(what: &str, error: impl std::fmt::Display) -> Self {
        InfraError::LockPoisoned(format!("{what}: {error}"))
    }
}
