use std::io;

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[source] rusqlite::Error),
    #[error("database is busy")]
    Busy,
    #[error("connection poisoned")]
    ConnectionPoisoned,
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                StorageError::Busy
            }
            _ => StorageError::DatabaseError(err),
        }
    }
}
