use crate::{EngineError, Result};
use std::fmt;

/// Return codes passed between engine layers.
///
/// `AsyncCompletion` and `DisableWaiterCancel` are not failures. Each one obliges
/// the caller to a specific follow-up (wait for the completion callback, keep
/// the speculative consumer reference) and must be passed up unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    /// Operation finished
    Ok,
    /// The waiter is disabled
    WaiterDisabled,
    /// The operation will be completed asynchronously
    AsyncCompletion,
    /// The waiter has been removed from the queue
    WaiterRemoved,
    /// The waiter is enabled
    WaiterEnabled,
    /// An asynchronous request to stop a waiter was cancelled
    DisableWaiterCancel,
    /// Generic failure reported by a lower layer
    Failure,
    /// The waiter is not in a state that allows the request
    WaiterInvalid,
    /// The queue has been deleted already
    QueueDeleted,
    /// The store rejected the commit
    StoreBusy,
}

impl ReturnCode {
    pub fn code(&self) -> u32 {
        match self {
            ReturnCode::Ok => 0,
            ReturnCode::WaiterDisabled => 9,
            ReturnCode::AsyncCompletion => 10,
            ReturnCode::WaiterRemoved => 20,
            ReturnCode::WaiterEnabled => 23,
            ReturnCode::DisableWaiterCancel => 28,
            ReturnCode::Failure => 101,
            ReturnCode::WaiterInvalid => 204,
            ReturnCode::QueueDeleted => 205,
            ReturnCode::StoreBusy => 504,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ReturnCode::Ok),
            9 => Some(ReturnCode::WaiterDisabled),
            10 => Some(ReturnCode::AsyncCompletion),
            20 => Some(ReturnCode::WaiterRemoved),
            23 => Some(ReturnCode::WaiterEnabled),
            28 => Some(ReturnCode::DisableWaiterCancel),
            101 => Some(ReturnCode::Failure),
            204 => Some(ReturnCode::WaiterInvalid),
            205 => Some(ReturnCode::QueueDeleted),
            504 => Some(ReturnCode::StoreBusy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnCode::Ok => "ok",
            ReturnCode::WaiterDisabled => "waiter_disabled",
            ReturnCode::AsyncCompletion => "async_completion",
            ReturnCode::WaiterRemoved => "waiter_removed",
            ReturnCode::WaiterEnabled => "waiter_enabled",
            ReturnCode::DisableWaiterCancel => "disable_waiter_cancel",
            ReturnCode::Failure => "failure",
            ReturnCode::WaiterInvalid => "waiter_invalid",
            ReturnCode::QueueDeleted => "queue_deleted",
            ReturnCode::StoreBusy => "store_busy",
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ReturnCode::Ok
    }

    /// True when the operation has been handed to a later completion callback
    pub fn is_async(&self) -> bool {
        *self == ReturnCode::AsyncCompletion
    }

    /// Codes that describe a real failure rather than a state report or a deferral
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ReturnCode::Failure
                | ReturnCode::WaiterInvalid
                | ReturnCode::QueueDeleted
                | ReturnCode::StoreBusy
        )
    }

    /// Keep the first failure seen while unwinding a chain of completions.
    ///
    /// Completion functions use this so that a later success never hides an
    /// earlier failure.
    pub fn or_first_failure(self, next: ReturnCode) -> ReturnCode {
        if self.is_failure() {
            self
        } else {
            next
        }
    }

    /// Convert failures into `EngineError`, leaving every other code intact
    pub fn into_result(self) -> Result<ReturnCode> {
        if self.is_failure() {
            Err(EngineError::Failed(self))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
