//! Error types for the custody sync engine.

use crate::{Record, RecordId, Sequence, TableName};
use thiserror::Error;

/// Local persistence failures.
///
/// A mutation that fails with a `StorageError` was not applied; no queue entry
/// exists for it and the caller must not assume otherwise.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Failures reported by the remote backend or the transport to it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemoteError {
    /// Transport failure, timeout, or a server-side condition worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The backend refused the mutation (validation, constraint, ...).
    #[error("remote rejected mutation ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend already holds a newer version of the record.
    #[error("remote holds a newer version of {}/{}", current.table, current.id)]
    Conflict { current: Box<Record> },

    #[error("record not found on remote")]
    NotFound,
}

impl RemoteError {
    /// Whether the failure is transient and should be retried indefinitely.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

/// All possible errors from the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    // Validation errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Mutation errors
    #[error("record not found: {table}/{id}")]
    RecordNotFound { table: TableName, id: RecordId },

    #[error("record already exists: {table}/{id}")]
    RecordAlreadyExists { table: TableName, id: RecordId },

    // Queue and review errors
    #[error("queue entry not found: {0}")]
    EntryNotFound(Sequence),

    #[error("queue entry {0} is not awaiting review")]
    NotInReview(Sequence),

    #[error("conflict not found: {0}")]
    ConflictNotFound(i64),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Sqlite(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(StorageError::Serialization(err))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn error_display() {
        let err = Error::TableNotFound("kits".into());
        assert_eq!(err.to_string(), "table not found: kits");

        let err = Error::RecordNotFound {
            table: "tools".into(),
            id: "42".into(),
        };
        assert_eq!(err.to_string(), "record not found: tools/42");

        let err = Error::TypeMismatch {
            field: "quantity".into(),
            expected: "number".into(),
            got: "text".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'quantity': expected number, got text"
        );
    }

    #[test]
    fn remote_error_display_and_transience() {
        let err = RemoteError::Rejected {
            status: 422,
            message: "serial number required".into(),
        };
        assert_eq!(
            err.to_string(),
            "remote rejected mutation (422): serial number required"
        );
        assert!(!err.is_transient());

        let conflict = RemoteError::Conflict {
            current: Box::new(Record::new("tools", "42", Map::new(), 10)),
        };
        assert_eq!(conflict.to_string(), "remote holds a newer version of tools/42");
        assert!(!conflict.is_transient());

        assert!(RemoteError::Network("connection refused".into()).is_transient());
    }

    #[test]
    fn storage_errors_convert_into_engine_errors() {
        let json_err = serde_json::from_str::<Record>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Storage(StorageError::Serialization(_))));
    }
}
