use msgq_core::ReturnCode;
use std::fmt;
use tracing::error;

const DISCONNECTED: u32 = 0x00;
const DISABLED: u32 = 0x01;
const ENABLED: u32 = 0x02;
const GETTING: u32 = 0x04;
const DELIVERING: u32 = 0x08;
const DISABLE_PEND: u32 = 0x10;
const CANCEL_DISABLE_PEND: u32 = 0x20;
const DISCONNECT_PEND: u32 = 0x40;
const PENDING_BITS: u32 = DISABLE_PEND | CANCEL_DISABLE_PEND | DISCONNECT_PEND;

/// Which kind of thread holds the waiter lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Exclusive rights to inspect or alter delivery
    Getting,
    /// A delivery thread handing messages to the consumer; re-checks waiters on unlock
    Delivering,
}

/// Requests recorded while the waiter is locked, acted on when it unlocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PendingActions {
    pub disable: bool,
    pub cancel_disable: bool,
    /// The waiter is being removed from its queue
    pub disconnect: bool,
}

impl PendingActions {
    pub const NONE: PendingActions = PendingActions {
        disable: false,
        cancel_disable: false,
        disconnect: false,
    };
    pub const DISABLE: PendingActions = PendingActions {
        disable: true,
        cancel_disable: false,
        disconnect: false,
    };
    pub const DISABLE_CANCELLED: PendingActions = PendingActions {
        disable: true,
        cancel_disable: true,
        disconnect: false,
    };
    pub const DISCONNECT: PendingActions = PendingActions {
        disable: false,
        cancel_disable: false,
        disconnect: true,
    };
    pub const DISABLE_DISCONNECT: PendingActions = PendingActions {
        disable: true,
        cancel_disable: false,
        disconnect: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.disable && !self.cancel_disable && !self.disconnect
    }

    /// A cancel always rides on a disable and never on a disconnect
    fn is_valid(&self) -> bool {
        !self.cancel_disable || (self.disable && !self.disconnect)
    }
}

/// Attach state of a consumer on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaiterState {
    /// Removed from its queue; no request is accepted any more
    Disconnected,
    Disabled,
    Enabled,
    Locked {
        kind: LockKind,
        pending: PendingActions,
    },
}

impl WaiterState {
    pub const fn locked(kind: LockKind) -> Self {
        WaiterState::Locked {
            kind,
            pending: PendingActions::NONE,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, WaiterState::Locked { .. })
    }

    /// Disconnected, or on its way there
    pub fn is_disconnecting(&self) -> bool {
        match self {
            WaiterState::Disconnected => true,
            WaiterState::Locked { pending, .. } => pending.disconnect,
            _ => false,
        }
    }

    /// Encoding stored in the atomic status word
    pub fn encode(self) -> u32 {
        match self {
            WaiterState::Disconnected => DISCONNECTED,
            WaiterState::Disabled => DISABLED,
            WaiterState::Enabled => ENABLED,
            WaiterState::Locked { kind, pending } => {
                let mut bits = match kind {
                    LockKind::Getting => GETTING,
                    LockKind::Delivering => DELIVERING,
                };
                if pending.disable {
                    bits |= DISABLE_PEND;
                }
                if pending.cancel_disable {
                    bits |= CANCEL_DISABLE_PEND;
                }
                if pending.disconnect {
                    bits |= DISCONNECT_PEND;
                }
                bits
            }
        }
    }

    /// Decode a status word, or `None` if no state encodes to it
    pub fn try_decode(bits: u32) -> Option<Self> {
        let pending = PendingActions {
            disable: bits & DISABLE_PEND != 0,
            cancel_disable: bits & CANCEL_DISABLE_PEND != 0,
            disconnect: bits & DISCONNECT_PEND != 0,
        };
        if !pending.is_valid() {
            return None;
        }

        match bits & !PENDING_BITS {
            DISCONNECTED if pending.is_empty() => Some(WaiterState::Disconnected),
            DISABLED if pending.is_empty() => Some(WaiterState::Disabled),
            ENABLED if pending.is_empty() => Some(WaiterState::Enabled),
            GETTING => Some(WaiterState::Locked {
                kind: LockKind::Getting,
                pending,
            }),
            DELIVERING => Some(WaiterState::Locked {
                kind: LockKind::Delivering,
                pending,
            }),
            _ => None,
        }
    }

    pub fn decode(bits: u32) -> Self {
        match Self::try_decode(bits) {
            Some(state) => state,
            None => {
                error!("Unrecognised waiter state {:#x}", bits);
                panic!("invalid waiter state {:#x}", bits);
            }
        }
    }
}

impl fmt::Display for WaiterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaiterState::Disconnected => write!(f, "DISCONNECTED"),
            WaiterState::Disabled => write!(f, "DISABLED"),
            WaiterState::Enabled => write!(f, "ENABLED"),
            WaiterState::Locked { kind, pending } => {
                match kind {
                    LockKind::Getting => write!(f, "GETTING")?,
                    LockKind::Delivering => write!(f, "DELIVERING")?,
                }
                if pending.disable {
                    write!(f, "+DISABLE_PEND")?;
                }
                if pending.cancel_disable {
                    write!(f, "+CANCEL_DISABLE_PEND")?;
                }
                if pending.disconnect {
                    write!(f, "+DISCONNECT_PEND")?;
                }
                Ok(())
            }
        }
    }
}

/// Delivery status as reported to a consumer's owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Started,
    Stopping,
    Stopped,
}

impl From<WaiterState> for DeliveryStatus {
    fn from(state: WaiterState) -> Self {
        match state {
            WaiterState::Disconnected | WaiterState::Disabled => DeliveryStatus::Stopped,
            WaiterState::Enabled => DeliveryStatus::Started,
            WaiterState::Locked { pending, .. } => {
                if pending.disconnect || (pending.disable && !pending.cancel_disable) {
                    DeliveryStatus::Stopping
                } else {
                    DeliveryStatus::Started
                }
            }
        }
    }
}

/// What a transition asks the controller to do once its CAS has succeeded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    /// Tell the consumer its waiter is disabled
    pub notify_disabled: bool,
    /// Ask the queue to look for deliverable messages
    pub check_waiters: bool,
    /// The caller now owns a self-taken lock and must drain it
    pub drain: bool,
    /// Tell the consumer its waiter has left the queue
    pub notify_removed: bool,
}

impl Effects {
    const NONE: Effects = Effects {
        notify_disabled: false,
        check_waiters: false,
        drain: false,
        notify_removed: false,
    };
}

/// Result of applying one event to a waiter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: WaiterState,
    pub rc: ReturnCode,
    pub effects: Effects,
    /// Change to the number of registrations the waiter holds on the consumer
    pub ref_delta: i32,
}

impl Transition {
    fn new(next: WaiterState, rc: ReturnCode) -> Self {
        Transition {
            next,
            rc,
            effects: Effects::NONE,
            ref_delta: 0,
        }
    }

    fn notify(mut self) -> Self {
        self.effects.notify_disabled = true;
        self
    }

    fn check_waiters(mut self) -> Self {
        self.effects.check_waiters = true;
        self
    }

    fn drain(mut self) -> Self {
        self.effects.drain = true;
        self
    }

    fn removed(mut self) -> Self {
        self.effects.notify_removed = true;
        self
    }

    fn refs(mut self, delta: i32) -> Self {
        self.ref_delta = delta;
        self
    }

    /// True if applying the transition leaves everything as it was
    pub fn is_noop(&self, from: WaiterState) -> bool {
        self.next == from && self.effects == Effects::NONE && self.ref_delta == 0
    }
}

/// Enable request, carrying a speculative consumer reference.
///
/// `ref_delta` is 1 when the reference is kept and 0 when it must be handed back.
pub fn enable(state: WaiterState) -> Transition {
    match state {
        WaiterState::Disconnected => Transition::new(state, ReturnCode::WaiterInvalid),
        WaiterState::Locked { pending, .. } if pending.disconnect => {
            Transition::new(state, ReturnCode::WaiterInvalid)
        }
        WaiterState::Disabled => Transition::new(WaiterState::Enabled, ReturnCode::Ok)
            .check_waiters()
            .refs(1),
        WaiterState::Enabled => Transition::new(state, ReturnCode::WaiterEnabled),
        WaiterState::Locked { kind, pending } => {
            if pending == PendingActions::DISABLE {
                Transition::new(
                    WaiterState::Locked {
                        kind,
                        pending: PendingActions::DISABLE_CANCELLED,
                    },
                    ReturnCode::DisableWaiterCancel,
                )
                .refs(1)
            } else {
                Transition::new(state, ReturnCode::WaiterEnabled)
            }
        }
    }
}

/// Disable request
pub fn disable(state: WaiterState) -> Transition {
    match state {
        WaiterState::Disconnected => Transition::new(state, ReturnCode::WaiterInvalid),
        WaiterState::Locked { pending, .. } if pending.disconnect => {
            Transition::new(state, ReturnCode::WaiterInvalid)
        }
        WaiterState::Disabled => Transition::new(state, ReturnCode::WaiterDisabled),
        WaiterState::Enabled => Transition::new(
            WaiterState::Locked {
                kind: LockKind::Getting,
                pending: PendingActions::DISABLE,
            },
            ReturnCode::Ok,
        )
        .drain(),
        WaiterState::Locked { kind, pending } => {
            let next = WaiterState::Locked {
                kind,
                pending: PendingActions::DISABLE,
            };
            if pending.cancel_disable {
                // the cancelled disable completes now; the cancelling enable stays registered
                Transition::new(next, ReturnCode::AsyncCompletion)
                    .notify()
                    .refs(-1)
            } else {
                Transition::new(next, ReturnCode::AsyncCompletion)
            }
        }
    }
}

/// Remove the waiter from its queue.
///
/// A locked waiter records the request and is disconnected by the lock holder;
/// an enabled one is locked here and drained by the caller.
pub fn terminate(state: WaiterState) -> Transition {
    match state {
        WaiterState::Disconnected => Transition::new(state, ReturnCode::WaiterInvalid),
        WaiterState::Locked { pending, .. } if pending.disconnect => {
            Transition::new(state, ReturnCode::WaiterInvalid)
        }
        WaiterState::Disabled => Transition::new(WaiterState::Disconnected, ReturnCode::Ok).removed(),
        WaiterState::Enabled => Transition::new(
            WaiterState::Locked {
                kind: LockKind::Getting,
                pending: PendingActions::DISCONNECT,
            },
            ReturnCode::Ok,
        )
        .drain(),
        WaiterState::Locked { kind, pending } => {
            let next = WaiterState::Locked {
                kind,
                pending: PendingActions {
                    cancel_disable: false,
                    disconnect: true,
                    ..pending
                },
            };
            if pending.cancel_disable {
                // the cancelled disable completes now, as for a second disable
                Transition::new(next, ReturnCode::AsyncCompletion)
                    .notify()
                    .refs(-1)
            } else {
                Transition::new(next, ReturnCode::AsyncCompletion)
            }
        }
    }
}

/// Try-lock: only an exactly-Enabled waiter can be locked
pub fn lock(state: WaiterState, kind: LockKind) -> Option<WaiterState> {
    match state {
        WaiterState::Enabled => Some(WaiterState::locked(kind)),
        _ => None,
    }
}

/// Suspend delivery from inside a locked section
pub fn suspend(state: WaiterState) -> Option<WaiterState> {
    match state {
        WaiterState::Locked { kind, pending } if !pending.disable => Some(WaiterState::Locked {
            kind,
            pending: PendingActions {
                disable: true,
                ..pending
            },
        }),
        WaiterState::Locked { .. } => Some(state),
        _ => None,
    }
}

/// Unlock, acting on whatever was requested while the lock was held.
///
/// Panics when the waiter is not locked.
pub fn complete(state: WaiterState) -> Transition {
    match state {
        WaiterState::Locked { kind, pending } => {
            if pending.disconnect {
                Transition::new(WaiterState::Disconnected, ReturnCode::WaiterRemoved)
                    .notify()
                    .removed()
                    .refs(-1)
            } else if pending == PendingActions::DISABLE_CANCELLED {
                Transition::new(WaiterState::Enabled, ReturnCode::Ok)
                    .notify()
                    .check_waiters()
                    .refs(-1)
            } else if pending == PendingActions::DISABLE {
                Transition::new(WaiterState::Disabled, ReturnCode::WaiterDisabled)
                    .notify()
                    .refs(-1)
            } else {
                let t = Transition::new(WaiterState::Enabled, ReturnCode::Ok);
                match kind {
                    LockKind::Delivering => t.check_waiters(),
                    LockKind::Getting => t,
                }
            }
        }
        _ => {
            error!("Completing waiter actions in unlocked state {}", state);
            panic!("waiter is not locked: {}", state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::LockKind::{Delivering, Getting};

    fn all_states() -> Vec<WaiterState> {
        let mut states = vec![
            WaiterState::Disconnected,
            WaiterState::Disabled,
            WaiterState::Enabled,
        ];
        for kind in [Getting, Delivering] {
            for pending in [
                PendingActions::NONE,
                PendingActions::DISABLE,
                PendingActions::DISABLE_CANCELLED,
                PendingActions::DISCONNECT,
                PendingActions::DISABLE_DISCONNECT,
            ] {
                states.push(WaiterState::Locked { kind, pending });
            }
        }
        states
    }

    fn locked(kind: LockKind, pending: PendingActions) -> WaiterState {
        WaiterState::Locked { kind, pending }
    }

    #[test]
    fn test_encoding_covers_exactly_the_valid_states() {
        let states = all_states();
        for state in &states {
            assert_eq!(WaiterState::decode(state.encode()), *state);
        }

        let valid: Vec<u32> = states.iter().map(|s| s.encode()).collect();
        for bits in 0..0x80u32 {
            assert_eq!(
                WaiterState::try_decode(bits).is_some(),
                valid.contains(&bits),
                "bits {:#x}",
                bits
            );
        }
    }

    #[test]
    #[should_panic(expected = "invalid waiter state")]
    fn test_decode_garbage_is_fatal() {
        WaiterState::decode(DISABLED | ENABLED);
    }

    #[test]
    fn test_transition_table() {
        use super::PendingActions as P;
        use msgq_core::ReturnCode as Rc;

        // (state, enable rc, enable next, enable refs, disable rc, disable next, disable refs)
        #[rustfmt::skip]
        let table = [
            (WaiterState::Disconnected, Rc::WaiterInvalid, WaiterState::Disconnected, 0,
             Rc::WaiterInvalid, WaiterState::Disconnected, 0),
            (WaiterState::Disabled, Rc::Ok, WaiterState::Enabled, 1,
             Rc::WaiterDisabled, WaiterState::Disabled, 0),
            (WaiterState::Enabled, Rc::WaiterEnabled, WaiterState::Enabled, 0,
             Rc::Ok, locked(Getting, P::DISABLE), 0),
            (locked(Getting, P::NONE), Rc::WaiterEnabled, locked(Getting, P::NONE), 0,
             Rc::AsyncCompletion, locked(Getting, P::DISABLE), 0),
            (locked(Getting, P::DISABLE), Rc::DisableWaiterCancel, locked(Getting, P::DISABLE_CANCELLED), 1,
             Rc::AsyncCompletion, locked(Getting, P::DISABLE), 0),
            (locked(Getting, P::DISABLE_CANCELLED), Rc::WaiterEnabled, locked(Getting, P::DISABLE_CANCELLED), 0,
             Rc::AsyncCompletion, locked(Getting, P::DISABLE), -1),
            (locked(Getting, P::DISCONNECT), Rc::WaiterInvalid, locked(Getting, P::DISCONNECT), 0,
             Rc::WaiterInvalid, locked(Getting, P::DISCONNECT), 0),
            (locked(Getting, P::DISABLE_DISCONNECT), Rc::WaiterInvalid, locked(Getting, P::DISABLE_DISCONNECT), 0,
             Rc::WaiterInvalid, locked(Getting, P::DISABLE_DISCONNECT), 0),
            (locked(Delivering, P::NONE), Rc::WaiterEnabled, locked(Delivering, P::NONE), 0,
             Rc::AsyncCompletion, locked(Delivering, P::DISABLE), 0),
            (locked(Delivering, P::DISABLE), Rc::DisableWaiterCancel, locked(Delivering, P::DISABLE_CANCELLED), 1,
             Rc::AsyncCompletion, locked(Delivering, P::DISABLE), 0),
            (locked(Delivering, P::DISABLE_CANCELLED), Rc::WaiterEnabled, locked(Delivering, P::DISABLE_CANCELLED), 0,
             Rc::AsyncCompletion, locked(Delivering, P::DISABLE), -1),
            (locked(Delivering, P::DISCONNECT), Rc::WaiterInvalid, locked(Delivering, P::DISCONNECT), 0,
             Rc::WaiterInvalid, locked(Delivering, P::DISCONNECT), 0),
            (locked(Delivering, P::DISABLE_DISCONNECT), Rc::WaiterInvalid, locked(Delivering, P::DISABLE_DISCONNECT), 0,
             Rc::WaiterInvalid, locked(Delivering, P::DISABLE_DISCONNECT), 0),
        ];
        assert_eq!(table.len(), all_states().len());

        for (state, en_rc, en_next, en_refs, dis_rc, dis_next, dis_refs) in table {
            let t = enable(state);
            assert_eq!((t.rc, t.next, t.ref_delta), (en_rc, en_next, en_refs), "enable from {}", state);

            let t = disable(state);
            assert_eq!((t.rc, t.next, t.ref_delta), (dis_rc, dis_next, dis_refs), "disable from {}", state);
            assert_eq!(t.effects.drain, state == WaiterState::Enabled);
            assert_eq!(t.effects.notify_disabled, dis_refs < 0);

            let expect_lock = if state == WaiterState::Enabled {
                Some(WaiterState::locked(Getting))
            } else {
                None
            };
            assert_eq!(lock(state, Getting), expect_lock);

            assert_eq!(suspend(state).is_some(), state.is_locked());
        }
    }

    #[test]
    fn test_terminate_table() {
        use super::PendingActions as P;
        use msgq_core::ReturnCode as Rc;

        // (state, rc, next, refs, notify_disabled, notify_removed, drain)
        #[rustfmt::skip]
        let table = [
            (WaiterState::Disconnected, Rc::WaiterInvalid, WaiterState::Disconnected, 0, false, false, false),
            (WaiterState::Disabled, Rc::Ok, WaiterState::Disconnected, 0, false, true, false),
            (WaiterState::Enabled, Rc::Ok, locked(Getting, P::DISCONNECT), 0, false, false, true),
            (locked(Getting, P::NONE), Rc::AsyncCompletion, locked(Getting, P::DISCONNECT), 0, false, false, false),
            (locked(Getting, P::DISABLE), Rc::AsyncCompletion, locked(Getting, P::DISABLE_DISCONNECT), 0, false, false, false),
            (locked(Getting, P::DISABLE_CANCELLED), Rc::AsyncCompletion, locked(Getting, P::DISABLE_DISCONNECT), -1, true, false, false),
            (locked(Getting, P::DISCONNECT), Rc::WaiterInvalid, locked(Getting, P::DISCONNECT), 0, false, false, false),
            (locked(Getting, P::DISABLE_DISCONNECT), Rc::WaiterInvalid, locked(Getting, P::DISABLE_DISCONNECT), 0, false, false, false),
            (locked(Delivering, P::NONE), Rc::AsyncCompletion, locked(Delivering, P::DISCONNECT), 0, false, false, false),
            (locked(Delivering, P::DISABLE), Rc::AsyncCompletion, locked(Delivering, P::DISABLE_DISCONNECT), 0, false, false, false),
            (locked(Delivering, P::DISABLE_CANCELLED), Rc::AsyncCompletion, locked(Delivering, P::DISABLE_DISCONNECT), -1, true, false, false),
            (locked(Delivering, P::DISCONNECT), Rc::WaiterInvalid, locked(Delivering, P::DISCONNECT), 0, false, false, false),
            (locked(Delivering, P::DISABLE_DISCONNECT), Rc::WaiterInvalid, locked(Delivering, P::DISABLE_DISCONNECT), 0, false, false, false),
        ];
        assert_eq!(table.len(), all_states().len());

        for (state, rc, next, refs, notify, removed, drain) in table {
            let t = terminate(state);
            assert_eq!((t.rc, t.next, t.ref_delta), (rc, next, refs), "terminate from {}", state);
            assert_eq!(t.effects.notify_disabled, notify, "terminate from {}", state);
            assert_eq!(t.effects.notify_removed, removed, "terminate from {}", state);
            assert_eq!(t.effects.drain, drain, "terminate from {}", state);
            assert!(!t.effects.check_waiters);
            assert!(t.next.is_disconnecting());
        }
    }

    #[test]
    fn test_complete_table() {
        use super::PendingActions as P;

        // (state, next, refs, notify, check_waiters)
        let table = [
            (locked(Getting, P::NONE), WaiterState::Enabled, 0, false, false),
            (locked(Getting, P::DISABLE), WaiterState::Disabled, -1, true, false),
            (locked(Getting, P::DISABLE_CANCELLED), WaiterState::Enabled, -1, true, true),
            (locked(Delivering, P::NONE), WaiterState::Enabled, 0, false, true),
            (locked(Delivering, P::DISABLE), WaiterState::Disabled, -1, true, false),
            (locked(Delivering, P::DISABLE_CANCELLED), WaiterState::Enabled, -1, true, true),
            (locked(Getting, P::DISCONNECT), WaiterState::Disconnected, -1, true, false),
            (locked(Getting, P::DISABLE_DISCONNECT), WaiterState::Disconnected, -1, true, false),
            (locked(Delivering, P::DISCONNECT), WaiterState::Disconnected, -1, true, false),
            (locked(Delivering, P::DISABLE_DISCONNECT), WaiterState::Disconnected, -1, true, false),
        ];

        for (state, next, refs, notify, check) in table {
            let t = complete(state);
            assert_eq!(t.effects.notify_removed, next == WaiterState::Disconnected);
            assert_eq!(t.next, next, "complete from {}", state);
            assert_eq!(t.ref_delta, refs, "complete from {}", state);
            assert_eq!(t.effects.notify_disabled, notify, "complete from {}", state);
            assert_eq!(t.effects.check_waiters, check, "complete from {}", state);
            assert!(!t.effects.drain);
        }
    }

    #[test]
    fn test_every_transition_lands_on_an_encodable_state() {
        for state in all_states() {
            let mut nexts = vec![enable(state).next, disable(state).next, terminate(state).next];
            nexts.extend(lock(state, Delivering));
            nexts.extend(suspend(state));
            if state.is_locked() {
                nexts.push(complete(state).next);
            }
            for next in nexts {
                assert_eq!(WaiterState::try_decode(next.encode()), Some(next));
            }
        }
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn test_complete_unlocked_is_fatal() {
        complete(WaiterState::Enabled);
    }

    #[test]
    fn test_delivery_status() {
        assert_eq!(DeliveryStatus::from(WaiterState::Disabled), DeliveryStatus::Stopped);
        assert_eq!(DeliveryStatus::from(WaiterState::Enabled), DeliveryStatus::Started);
        assert_eq!(
            DeliveryStatus::from(locked(Delivering, PendingActions::DISABLE)),
            DeliveryStatus::Stopping
        );
        assert_eq!(
            DeliveryStatus::from(locked(Getting, PendingActions::DISABLE_CANCELLED)),
            DeliveryStatus::Started
        );
        assert_eq!(
            DeliveryStatus::from(locked(Delivering, PendingActions::DISCONNECT)),
            DeliveryStatus::Stopping
        );
        assert_eq!(DeliveryStatus::from(WaiterState::Disconnected), DeliveryStatus::Stopped);
    }
}
