use msgq_core::{EngineContext, ReturnCode};

/// The queue a waiter belongs to, as seen from the waiter
pub trait DeliveryQueue: Send + Sync {
    /// Look for messages that can be delivered to enabled waiters
    fn check_waiters(&self, ctx: &mut EngineContext) -> ReturnCode;

    fn is_deleted(&self) -> bool {
        false
    }
}
