use thiserror::Error;

/// Errors raised by key-value store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this id exists in the table.
    #[error("record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored body could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The record body was not a JSON object.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
