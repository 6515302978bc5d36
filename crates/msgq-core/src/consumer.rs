use crate::{EngineContext, ReturnCode};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier for a consumer
pub type ConsumerId = Uuid;

/// Unique identifier for a session
pub type SessionId = Uuid;

/// Callbacks from the engine to whoever owns a consumer (normally the protocol layer)
pub trait ConsumerListener: Send + Sync {
    /// Delivery status change, e.g. `WaiterDisabled` once a disable has completed
    fn delivery_status(&self, _ctx: &mut EngineContext, _consumer: &Consumer, _status: ReturnCode) {}

    /// Message hand-off while the waiter is locked for delivery.
    /// Returning false asks the engine to stop delivering after this callback.
    fn deliver(&self, _ctx: &mut EngineContext, _consumer: &Consumer) -> bool {
        true
    }

    /// The last reference to the consumer has gone
    fn destroyed(&self, _consumer_id: ConsumerId) {}
}

/// Listener that ignores every callback
#[derive(Debug, Default)]
pub struct NoopListener;

impl ConsumerListener for NoopListener {}

/// Session owning one or more consumers
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client_id: String,
    active_callbacks: AtomicU32,
}

impl Session {
    pub fn new(client_id: impl Into<String>) -> Self {
        Session {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
            active_callbacks: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of callbacks currently running against consumers of this session
    pub fn active_callbacks(&self) -> u32 {
        self.active_callbacks.load(Ordering::Acquire)
    }

    /// Count a callback as active until the guard is dropped
    pub fn enter_callback(&self) -> CallbackGuard<'_> {
        self.active_callbacks.fetch_add(1, Ordering::AcqRel);
        CallbackGuard { session: self }
    }
}

/// Keeps a session's active-callback counter raised for its lifetime
pub struct CallbackGuard<'a> {
    session: &'a Session,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        let previous = self.session.active_callbacks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }
}

/// A consumer registered on a queue
pub struct Consumer {
    id: ConsumerId,
    queue_name: String,
    session: Arc<Session>,
    listener: Arc<dyn ConsumerListener>,
}

impl Consumer {
    pub fn new(
        queue_name: impl Into<String>,
        session: Arc<Session>,
        listener: Arc<dyn ConsumerListener>,
    ) -> Self {
        Consumer {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            session,
            listener,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Name of the queue this consumer is attached to
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Tell the consumer's owner about a delivery status change
    pub fn notify_status(&self, ctx: &mut EngineContext, status: ReturnCode) {
        let _active = self.session.enter_callback();
        ctx.stats_mut().callbacks_invoked += 1;
        self.listener.delivery_status(ctx, self, status);
    }

    /// Hand a message to the consumer's owner
    pub fn deliver(&self, ctx: &mut EngineContext) -> bool {
        let _active = self.session.enter_callback();
        ctx.stats_mut().callbacks_invoked += 1;
        self.listener.deliver(ctx, self)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("queue_name", &self.queue_name)
            .field("session", &self.session.id())
            .finish()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        debug!("Destroying consumer {} on queue {}", self.id, self.queue_name);
        self.listener.destroyed(self.id);
    }
}

/// Shared ownership of a consumer.
///
/// The consumer's use count is the number of live handles. The session, the
/// waiter registration and any running callback each hold one, and the
/// consumer is destroyed exactly once when the last handle is dropped.
#[derive(Clone)]
pub struct ConsumerHandle(Arc<Consumer>);

impl ConsumerHandle {
    pub fn new(consumer: Consumer) -> Self {
        ConsumerHandle(Arc::new(consumer))
    }

    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &ConsumerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for ConsumerHandle {
    type Target = Consumer;

    fn deref(&self) -> &Consumer {
        &self.0
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("consumer", &self.0.id)
            .field("use_count", &self.use_count())
            .finish()
    }
}
