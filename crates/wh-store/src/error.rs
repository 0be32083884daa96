//! Store-crate error type, following `OutboxError`/`EventStoreError`'s
//! shape in the teacher codebase: one enum, a `From<sqlx::Error>` for the
//! common case, named variants for everything `spec.md` §7 distinguishes.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("schema missing: {detail}")]
    SchemaMissing { detail: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::SchemaMissing {
                detail: "expected row not found".to_string(),
            },
            sqlx::Error::ColumnNotFound(col) => StoreError::SchemaMissing {
                detail: format!("column not found: {col}"),
            },
            _ => StoreError::ConnectionError {
                message: e.to_string(),
            },
        }
    }
}

impl From<StoreError> for wh_ports::WorkStoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConnectionError { message } => {
                wh_ports::WorkStoreError::ConnectionError { message }
            }
            StoreError::SerializationError { message } => {
                wh_ports::WorkStoreError::SerializationError { message }
            }
            StoreError::SchemaMissing { detail } => {
                wh_ports::WorkStoreError::SchemaMissing { detail }
            }
        }
    }
}
