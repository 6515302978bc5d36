use crate::queue::DeliveryQueue;
use crate::state::{self, DeliveryStatus, LockKind, Transition, WaiterState};
use crate::status::WaiterStatus;
use msgq_core::{Consumer, ConsumerHandle, ConsumerId, EngineContext, ReturnCode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Options for [`Waiter::enable_waiter`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EnableOptions {
    /// Do not kick the queue's check-waiters after enabling
    pub deliver_later: bool,
}

/// Options for [`Waiter::complete_waiter_actions`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CompleteOptions {
    /// Do not kick the queue's check-waiters if the waiter ends up enabled
    pub no_deliver: bool,
}

/// Result of an enable request.
///
/// The consumer reference passed to [`Waiter::enable_waiter`] is either kept
/// by the waiter or handed back inside the outcome, so dropping a rejected
/// outcome undoes the caller's speculative reference.
#[derive(Debug)]
pub enum EnableOutcome {
    /// Disabled to Enabled; `delivery` is what check-waiters reported
    Enabled { delivery: ReturnCode },
    /// A pending disable was cancelled; the waiter keeps the reference
    DisableCancelled,
    AlreadyEnabled(ConsumerHandle),
    QueueDeleted(ConsumerHandle),
    /// The waiter is disconnected or being disconnected
    Invalid(ConsumerHandle),
}

impl EnableOutcome {
    /// Code reported to the caller; a successful enable reports check-waiters' code
    pub fn rc(&self) -> ReturnCode {
        match self {
            EnableOutcome::Enabled { delivery } => *delivery,
            EnableOutcome::DisableCancelled => ReturnCode::DisableWaiterCancel,
            EnableOutcome::AlreadyEnabled(_) => ReturnCode::WaiterEnabled,
            EnableOutcome::QueueDeleted(_) => ReturnCode::QueueDeleted,
            EnableOutcome::Invalid(_) => ReturnCode::WaiterInvalid,
        }
    }

    /// The reference handed back by a rejected request
    pub fn into_returned(self) -> Option<ConsumerHandle> {
        match self {
            EnableOutcome::AlreadyEnabled(consumer)
            | EnableOutcome::QueueDeleted(consumer)
            | EnableOutcome::Invalid(consumer) => Some(consumer),
            _ => None,
        }
    }
}

/// Attach state of one consumer on one queue.
///
/// The state word is only changed by compare-and-swap. The waiter keeps one
/// consumer reference per registration: one while enabled, two while a
/// cancelled disable is waiting to drain, none while disabled or disconnected.
pub struct Waiter {
    consumer_id: ConsumerId,
    queue_name: String,
    status: WaiterStatus,
    registrations: Mutex<Vec<ConsumerHandle>>,
    queue: Arc<dyn DeliveryQueue>,
}

impl Waiter {
    pub fn new(consumer: &Consumer, queue: Arc<dyn DeliveryQueue>) -> Self {
        Waiter {
            consumer_id: consumer.id(),
            queue_name: consumer.queue_name().to_string(),
            status: WaiterStatus::default(),
            registrations: Mutex::new(Vec::new()),
            queue,
        }
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> WaiterState {
        self.status.load()
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        DeliveryStatus::from(self.state())
    }

    /// Consumer references currently held by the waiter
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Enable delivery to the consumer.
    ///
    /// `consumer` is the caller's speculative reference; see [`EnableOutcome`].
    pub fn enable_waiter(
        &self,
        ctx: &mut EngineContext,
        consumer: ConsumerHandle,
        options: EnableOptions,
    ) -> EnableOutcome {
        if consumer.id() != self.consumer_id {
            error!(
                "Enable for consumer {} on waiter of consumer {}",
                consumer.id(),
                self.consumer_id
            );
            panic!("consumer {} does not own this waiter", consumer.id());
        }

        if self.queue.is_deleted() {
            debug!("Queue {} deleted, not enabling {}", self.queue_name, self.consumer_id);
            return EnableOutcome::QueueDeleted(consumer);
        }

        // Registered before the CAS so a racing release always finds it
        self.registrations.lock().push(consumer);

        loop {
            let current = self.status.load();
            let t = state::enable(current);

            if t.ref_delta == 0 {
                debug!("Enable of consumer {} rejected in state {}: {}", self.consumer_id, current, t.rc);
                let consumer = self.take_newest_registration();
                return match t.rc {
                    ReturnCode::WaiterEnabled => EnableOutcome::AlreadyEnabled(consumer),
                    _ => EnableOutcome::Invalid(consumer),
                };
            }

            if !self.status.try_lock_to_state(current, t.next) {
                continue;
            }
            self.trace("enable", current, &t);

            if t.rc == ReturnCode::DisableWaiterCancel {
                info!("Cancelled pending disable of consumer {}", self.consumer_id);
                return EnableOutcome::DisableCancelled;
            }

            let delivery = if t.effects.check_waiters && !options.deliver_later {
                self.check_waiters(ctx)
            } else {
                ReturnCode::Ok
            };
            return EnableOutcome::Enabled { delivery };
        }
    }

    /// Disable delivery to the consumer.
    ///
    /// Returns `AsyncCompletion` when the waiter is locked; the disable then
    /// completes when the lock holder calls [`Waiter::complete_waiter_actions`].
    pub fn disable_waiter(&self, ctx: &mut EngineContext) -> ReturnCode {
        loop {
            let current = self.status.load();
            let t = state::disable(current);

            if t.is_noop(current) {
                return t.rc;
            }
            if !self.status.try_lock_to_state(current, t.next) {
                continue;
            }
            self.trace("disable", current, &t);

            if t.ref_delta < 0 {
                warn!(
                    "Disable of consumer {} after a cancelled disable, releasing earlier registration",
                    self.consumer_id
                );
                self.release_registration(ctx, t.effects.notify_disabled);
            }
            if t.effects.drain {
                self.complete_waiter_actions(ctx, CompleteOptions::default());
            }
            return t.rc;
        }
    }

    /// Lock an enabled waiter without blocking
    pub fn try_lock(&self, kind: LockKind) -> bool {
        let current = self.status.load();
        match state::lock(current, kind) {
            Some(next) => self.status.try_lock_to_state(current, next),
            None => false,
        }
    }

    /// Unlock a waiter locked by this thread, acting on any pending requests.
    ///
    /// A pending disable or disconnect is reported to the consumer while the
    /// waiter is still locked. Flags added meanwhile never withdraw that
    /// report, so it is made at most once across CAS retries.
    pub fn complete_waiter_actions(&self, ctx: &mut EngineContext, options: CompleteOptions) -> ReturnCode {
        let mut notified = false;
        loop {
            let current = self.status.load();
            let t = state::complete(current);

            if t.effects.notify_disabled && !notified {
                self.notify_registered(ctx, ReturnCode::WaiterDisabled);
                notified = true;
            }
            if !self.status.try_lock_to_state(current, t.next) {
                continue;
            }
            self.trace("complete", current, &t);

            if t.ref_delta < 0 {
                let consumer = self.take_oldest_registration();
                if t.effects.notify_removed {
                    info!("Consumer {} removed from {}", self.consumer_id, self.queue_name);
                    consumer.notify_status(ctx, ReturnCode::WaiterRemoved);
                }
                self.log_release(&consumer);
            }
            if t.effects.check_waiters && !options.no_deliver {
                self.check_waiters(ctx);
            }
            return t.rc;
        }
    }

    /// Remove the waiter from its queue.
    ///
    /// `consumer` is the caller's own reference, used to report the removal
    /// of a waiter that holds none. Returns `AsyncCompletion` when the waiter
    /// is locked; the lock holder then finishes the removal on unlock.
    /// Returns `WaiterInvalid` when a removal already happened.
    pub fn terminate_waiter(&self, ctx: &mut EngineContext, consumer: &ConsumerHandle) -> ReturnCode {
        if consumer.id() != self.consumer_id {
            error!(
                "Terminate for consumer {} on waiter of consumer {}",
                consumer.id(),
                self.consumer_id
            );
            panic!("consumer {} does not own this waiter", consumer.id());
        }

        loop {
            let current = self.status.load();
            let t = state::terminate(current);

            if t.is_noop(current) {
                debug!("Waiter for consumer {} already disconnecting ({})", self.consumer_id, current);
                return t.rc;
            }
            if !self.status.try_lock_to_state(current, t.next) {
                continue;
            }
            self.trace("terminate", current, &t);

            if t.ref_delta < 0 {
                self.release_registration(ctx, t.effects.notify_disabled);
            }
            if t.effects.notify_removed {
                info!("Consumer {} removed from {}", self.consumer_id, self.queue_name);
                consumer.notify_status(ctx, ReturnCode::WaiterRemoved);
            }
            if t.effects.drain {
                self.complete_waiter_actions(ctx, CompleteOptions { no_deliver: true });
            }
            return t.rc;
        }
    }

    /// From inside a locked section, stop delivery once the lock is released
    pub fn suspend_delivery(&self) {
        loop {
            let current = self.status.load();
            let Some(next) = state::suspend(current) else {
                error!("Suspending delivery of unlocked waiter in state {}", current);
                panic!("waiter is not locked: {}", current);
            };
            if next == current || self.status.try_lock_to_state(current, next) {
                return;
            }
        }
    }

    /// Hand the consumer a delivery under the Delivering lock.
    ///
    /// Returns false if the waiter was not enabled.
    pub fn deliver(&self, ctx: &mut EngineContext) -> bool {
        if !self.try_lock(LockKind::Delivering) {
            return false;
        }

        let consumer = self.registrations.lock().first().cloned();
        let Some(consumer) = consumer else {
            error!("Enabled waiter for consumer {} has no registration", self.consumer_id);
            panic!("enabled waiter without registration");
        };

        if !consumer.deliver(ctx) {
            debug!("Consumer {} asked to stop delivery", self.consumer_id);
            self.suspend_delivery();
        }
        drop(consumer);

        self.complete_waiter_actions(ctx, CompleteOptions::default());
        true
    }

    fn take_newest_registration(&self) -> ConsumerHandle {
        let newest = self.registrations.lock().pop();
        match newest {
            Some(consumer) => consumer,
            None => {
                error!("No registration to hand back on consumer {}", self.consumer_id);
                panic!("waiter registrations underflow");
            }
        }
    }

    fn take_oldest_registration(&self) -> ConsumerHandle {
        let oldest = {
            let mut registrations = self.registrations.lock();
            if registrations.is_empty() {
                None
            } else {
                Some(registrations.remove(0))
            }
        };

        match oldest {
            Some(consumer) => consumer,
            None => {
                error!("No registration to release on consumer {}", self.consumer_id);
                panic!("waiter registrations underflow");
            }
        }
    }

    fn release_registration(&self, ctx: &mut EngineContext, notify: bool) {
        let consumer = self.take_oldest_registration();
        if notify {
            consumer.notify_status(ctx, ReturnCode::WaiterDisabled);
        }
        self.log_release(&consumer);
    }

    fn log_release(&self, consumer: &ConsumerHandle) {
        debug!(
            "Released registration on consumer {}, {} references left",
            self.consumer_id,
            consumer.use_count() - 1
        );
    }

    /// Report `status` through a registration; a locked waiter always holds one
    fn notify_registered(&self, ctx: &mut EngineContext, status: ReturnCode) {
        let consumer = self.registrations.lock().first().cloned();
        let Some(consumer) = consumer else {
            error!("Locked waiter for consumer {} has no registration", self.consumer_id);
            panic!("locked waiter without registration");
        };
        consumer.notify_status(ctx, status);
    }

    fn check_waiters(&self, ctx: &mut EngineContext) -> ReturnCode {
        let rc = self.queue.check_waiters(ctx);
        if rc.is_failure() {
            warn!("Check-waiters on {} for consumer {} failed: {}", self.queue_name, self.consumer_id, rc);
        }
        rc
    }

    fn trace(&self, op: &str, from: WaiterState, t: &Transition) {
        debug!(
            "Waiter {} on {}: {} {} -> {} ({})",
            self.consumer_id, self.queue_name, op, from, t.next, t.rc
        );
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("consumer_id", &self.consumer_id)
            .field("queue_name", &self.queue_name)
            .field("state", &self.state())
            .field("registrations", &self.registration_count())
            .finish()
    }
}
