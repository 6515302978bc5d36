use crate::controller::Waiter;
use crate::state::{DeliveryStatus, WaiterState};
use msgq_core::{ConsumerHandle, ConsumerId, EngineContext, EngineError, Result, ReturnCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Waiters attached to one queue, keyed by consumer
pub struct WaiterRegistry {
    queue_name: String,
    waiters: RwLock<HashMap<ConsumerId, Arc<Waiter>>>,
}

impl WaiterRegistry {
    pub fn new(queue_name: impl Into<String>) -> Self {
        WaiterRegistry {
            queue_name: queue_name.into(),
            waiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Attach a freshly created waiter
    pub fn attach(&self, waiter: Arc<Waiter>) -> Result<()> {
        let mut waiters = self.waiters.write();
        let consumer_id = waiter.consumer_id();
        if waiters.contains_key(&consumer_id) {
            return Err(EngineError::WaiterActive(consumer_id.to_string()));
        }
        waiters.insert(consumer_id, waiter);
        info!("Attached waiter for consumer {} to {}", consumer_id, self.queue_name);
        Ok(())
    }

    /// Detach a consumer's waiter in whatever state it is in.
    ///
    /// Returns `AsyncCompletion` when the waiter is locked; the consumer is
    /// told `WaiterRemoved` once the lock holder lets go.
    pub fn detach(&self, ctx: &mut EngineContext, consumer: &ConsumerHandle) -> Result<ReturnCode> {
        let consumer_id = consumer.id();
        let waiter = self
            .waiters
            .write()
            .remove(&consumer_id)
            .ok_or_else(|| EngineError::WaiterNotFound(consumer_id.to_string()))?;

        let rc = waiter.terminate_waiter(ctx, consumer);
        debug!("Terminated waiter for consumer {}: {}", consumer_id, rc);
        info!("Detached waiter for consumer {} from {}", consumer_id, self.queue_name);
        rc.into_result()
    }

    pub fn get(&self, consumer_id: &ConsumerId) -> Option<Arc<Waiter>> {
        self.waiters.read().get(consumer_id).cloned()
    }

    /// Waiters a delivery thread could currently hand messages to
    pub fn deliverable_waiters(&self) -> Vec<Arc<Waiter>> {
        self.waiters
            .read()
            .values()
            .filter(|w| w.state() == WaiterState::Enabled)
            .cloned()
            .collect()
    }

    pub fn count_by_status(&self, status: DeliveryStatus) -> usize {
        self.waiters
            .read()
            .values()
            .filter(|w| w.delivery_status() == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.waiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.read().is_empty()
    }
}
