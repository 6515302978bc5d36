mod consumer;
mod context;
mod error;
mod rc;

pub use consumer::{
    CallbackGuard, Consumer, ConsumerHandle, ConsumerId, ConsumerListener, NoopListener, Session,
    SessionId,
};
pub use context::{ContextStats, EngineContext};
pub use error::{EngineError, Result};
pub use rc::ReturnCode;
