use cadence_agent::RepositoryError;
use thiserror::Error;

/// Failure of a single repository query.
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite rejected the statement or a row could not be read.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection became available.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// An update targeted a row that does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The blocking task running the query panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DbError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<DbError> for RepositoryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { kind, id } => RepositoryError::NotFound { kind, id },
            other => RepositoryError::Storage(other.to_string()),
        }
    }
}
