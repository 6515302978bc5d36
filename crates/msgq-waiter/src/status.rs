use crate::state::WaiterState;
use std::sync::atomic::{AtomicU32, Ordering};

/// Atomic status word of a waiter.
///
/// Only encodings produced by [`WaiterState::encode`] are ever stored.
#[derive(Debug)]
pub struct WaiterStatus {
    bits: AtomicU32,
}

impl WaiterStatus {
    pub fn new(state: WaiterState) -> Self {
        WaiterStatus {
            bits: AtomicU32::new(state.encode()),
        }
    }

    pub fn load(&self) -> WaiterState {
        WaiterState::decode(self.bits.load(Ordering::Acquire))
    }

    /// Move from `expected` to `new` if nobody changed the word in between
    pub fn try_lock_to_state(&self, expected: WaiterState, new: WaiterState) -> bool {
        self.bits
            .compare_exchange(
                expected.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for WaiterStatus {
    fn default() -> Self {
        WaiterStatus::new(WaiterState::Disabled)
    }
}
