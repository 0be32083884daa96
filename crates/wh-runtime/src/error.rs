//! Runtime-crate error type.

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store error: {message}")]
    StoreError { message: String },

    #[error("channel closed")]
    ChannelClosed,

    #[error("dispose flush deadline exceeded; {dropped} queued item(s) were dropped")]
    DisposeDeadlineExceeded { dropped: usize },
}

impl From<wh_ports::WorkStoreError> for RuntimeError {
    fn from(e: wh_ports::WorkStoreError) -> Self {
        RuntimeError::StoreError {
            message: e.to_string(),
        }
    }
}
