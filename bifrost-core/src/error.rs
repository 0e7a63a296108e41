use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("datastore error: {0}")]
    Store(#[from] sled::Error),
    #[error("datastore transaction aborted: {0}")]
    Transaction(String),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("conversion failed: {0}")]
    Convert(String),
    #[error("task queue error: {0}")]
    TaskQueue(String),
}

impl<E: std::fmt::Display> From<sled::transaction::TransactionError<E>> for CoreError {
    fn from(error: sled::transaction::TransactionError<E>) -> Self {
        match error {
            sled::transaction::TransactionError::Storage(e) => CoreError::Store(e),
            sled::transaction::TransactionError::Abort(e) => CoreError::Transaction(e.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, CoreError>;
