use crate::ReturnCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Operation failed: {0}")]
    Failed(ReturnCode),

    #[error("Waiter for consumer {0} is still active")]
    WaiterActive(String),

    #[error("Waiter not found: {0}")]
    WaiterNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure of a commit store; the source keeps the store's own error type
    #[error("Store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Other error: {0}")]
    Other(String),
}

impl EngineError {
    /// The return code a protocol layer would report for this error
    pub fn return_code(&self) -> ReturnCode {
        match self {
            EngineError::Failed(rc) => *rc,
            EngineError::WaiterActive(_) | EngineError::WaiterNotFound(_) => {
                ReturnCode::WaiterInvalid
            }
            EngineError::Store(_) => ReturnCode::StoreBusy,
            _ => ReturnCode::Failure,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
