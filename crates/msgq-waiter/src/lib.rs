//! Consumer waiter state machine and the controller that drives it.

mod controller;
mod queue;
mod registry;
pub mod state;
mod status;

pub use controller::{CompleteOptions, EnableOptions, EnableOutcome, Waiter};
pub use queue::DeliveryQueue;
pub use registry::WaiterRegistry;
pub use state::{DeliveryStatus, LockKind, PendingActions, WaiterState};
pub use status::WaiterStatus;
