use thiserror::Error;

/// Errors surfaced by document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("malformed filter or update: {0}")]
    Malformed(String),

    #[error("injected failure")]
    Injected,
}
