//! Deferred-completion framework: the async action stack, its completion
//! driver, and the commit-store seam persistence layers plug into.

mod driver;
mod stack;
mod store;

pub use driver::complete_async_data;
pub use stack::{
    AsyncEntry, AsyncHandle, AsyncStack, Continuation, EntryKind, EntryView, ExternalFn,
    HeapStack, InternalFn, PoppedEntry, StackConfig, Step, DEFAULT_INITIAL_ENTRIES,
    DEFAULT_INITIAL_PAYLOAD_BYTES,
};
pub use store::{
    commit_step, AsyncCommitter, CommitObserver, CommitStep, CommitStore, CommitterConfig,
    SyncStore,
};

use msgq_core::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Committer worker failed: {0}")]
    Worker(String),

    #[error("Committer already stopped")]
    Stopped,
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
