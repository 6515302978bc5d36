use crate::stack::{AsyncStack, Continuation, HeapStack, Step};
use msgq_core::{EngineContext, ReturnCode};
use tracing::debug;

/// Unwind `stack`, running every pending completion in LIFO order.
///
/// Each entry is popped (with its exact payload length) before its
/// continuation runs, so it runs exactly once. `rc` flows from one entry to
/// the next; internal continuations may replace it. The caller entry, if
/// any, runs after every other entry and receives the final code.
///
/// Returns the code handed to the caller entry, or `AsyncCompletion` if an
/// internal continuation deferred again. In that case the remaining entries
/// (including the caller entry) stay on the stack for the next completion.
pub fn complete_async_data(
    ctx: &mut EngineContext,
    rc: ReturnCode,
    stack: &mut AsyncStack,
) -> ReturnCode {
    let mut rc = rc;
    ctx.stats_mut().completions_driven += 1;

    while let Some((entry, continuation)) = stack.take_top() {
        ctx.stats_mut().stack_pops += 1;
        let tag = entry.tag;

        match continuation {
            Continuation::Internal(f) => match f(ctx, rc, stack, entry) {
                Step::Continue(next) => rc = next,
                Step::Deferred => {
                    debug!(
                        "Async entry '{}' deferred again, {} entries left on the stack",
                        tag,
                        stack.used()
                    );
                    return ReturnCode::AsyncCompletion;
                }
            },
            Continuation::External(f) => {
                let handle = entry.handle;
                f(rc, handle, entry.payload);
            }
        }
    }

    if let Some((tag, callback, handle, payload)) = stack.take_caller() {
        debug!("Completing caller entry '{}' with {}", tag, rc);
        callback(rc, handle, payload);
    }

    rc
}

impl HeapStack {
    /// Drive a promoted stack to completion from whichever thread finished the I/O
    pub fn complete(self, ctx: &mut EngineContext, rc: ReturnCode) -> ReturnCode {
        let mut stack = self.into_stack();
        complete_async_data(ctx, rc, &mut stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{AsyncEntry, AsyncHandle, StackConfig};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        counts: [AtomicUsize; 4],
        order: Mutex<Vec<&'static str>>,
    }

    impl Calls {
        fn record(&self, slot: usize, tag: &'static str) {
            self.counts[slot].fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(tag);
        }

        fn counts(&self) -> [usize; 4] {
            [0, 1, 2, 3].map(|i| self.counts[i].load(Ordering::SeqCst))
        }
    }

    fn counted(calls: &Arc<Calls>, slot: usize, tag: &'static str) -> AsyncEntry {
        let calls = calls.clone();
        AsyncEntry::internal(tag, move |_ctx, rc, _stack, _entry| {
            calls.record(slot, tag);
            Step::Continue(rc)
        })
    }

    fn run_pass(calls: &Arc<Calls>) -> ReturnCode {
        let mut ctx = EngineContext::new("driver");
        let caller_calls = calls.clone();
        let caller = AsyncEntry::external("caller", move |_rc, _handle, _context| {
            caller_calls.record(3, "caller");
        });
        let mut stack = AsyncStack::with_caller(StackConfig::default(), caller);

        stack.push(&mut ctx, counted(calls, 0, "A"));
        stack.push(&mut ctx, counted(calls, 1, "B"));
        stack.push(&mut ctx, counted(calls, 2, "C"));

        let rc = complete_async_data(&mut ctx, ReturnCode::Ok, &mut stack);
        assert!(stack.is_empty());
        assert!(!stack.has_caller());
        rc
    }

    #[test]
    fn test_entries_run_lifo_then_caller() {
        let calls = Arc::new(Calls::default());

        assert_eq!(run_pass(&calls), ReturnCode::Ok);
        assert_eq!(*calls.order.lock(), vec!["C", "B", "A", "caller"]);
        assert_eq!(calls.counts(), [1, 1, 1, 1]);

        assert_eq!(run_pass(&calls), ReturnCode::Ok);
        assert_eq!(calls.counts(), [2, 2, 2, 2]);
    }

    #[test]
    fn test_return_code_flows_to_caller() {
        let mut ctx = EngineContext::new("driver");
        let seen = Arc::new(Mutex::new(None));
        let seen_by_caller = seen.clone();
        let caller = AsyncEntry::external("caller", move |rc, handle, context| {
            let handle = handle.and_then(|h| h.downcast::<String>().ok());
            *seen_by_caller.lock() = Some((rc, handle.map(|h| (*h).clone()), context));
        })
        .with_payload(b"ctx");
        let mut stack = AsyncStack::with_caller(StackConfig::default(), caller);

        stack.push(
            &mut ctx,
            AsyncEntry::internal("first-failure", |_ctx, rc, _stack, _entry| {
                Step::Continue(rc.or_first_failure(ReturnCode::StoreBusy))
            }),
        );
        stack.push(
            &mut ctx,
            AsyncEntry::internal("fails", |_ctx, rc, _stack, entry| {
                assert_eq!(&entry.payload[..], b"payload");
                Step::Continue(rc.or_first_failure(ReturnCode::Failure))
            })
            .with_payload(b"payload"),
        );
        let created: AsyncHandle = Arc::new(String::from("created"));
        stack.set_caller_handle(created);

        let rc = complete_async_data(&mut ctx, ReturnCode::Ok, &mut stack);

        assert_eq!(rc, ReturnCode::Failure);
        let (caller_rc, handle, context) = seen.lock().take().unwrap();
        assert_eq!(caller_rc, ReturnCode::Failure);
        assert_eq!(handle.as_deref(), Some("created"));
        assert_eq!(context, Bytes::from_static(b"ctx"));
        assert_eq!(ctx.stats().stack_pops, 2);
    }

    #[test]
    fn test_internal_entry_can_fan_out() {
        let calls = Arc::new(Calls::default());
        let mut ctx = EngineContext::new("driver");
        let mut stack = AsyncStack::new();

        let inner = calls.clone();
        stack.push(
            &mut ctx,
            AsyncEntry::internal("split", move |ctx, rc, stack, _entry| {
                inner.record(0, "split");
                stack.push(ctx, counted(&inner, 1, "part-1"));
                stack.push(ctx, counted(&inner, 2, "part-2"));
                Step::Continue(rc)
            }),
        );

        let rc = complete_async_data(&mut ctx, ReturnCode::Ok, &mut stack);
        assert_eq!(rc, ReturnCode::Ok);
        assert_eq!(*calls.order.lock(), vec!["split", "part-2", "part-1"]);
    }

    #[test]
    fn test_deferred_entry_stops_the_driver() {
        let calls = Arc::new(Calls::default());
        let mut ctx = EngineContext::new("driver");
        let caller_calls = calls.clone();
        let caller = AsyncEntry::external("caller", move |_rc, _handle, _context| {
            caller_calls.record(3, "caller");
        });
        let mut stack = AsyncStack::with_caller(StackConfig::default(), caller);

        stack.push(&mut ctx, counted(&calls, 0, "A"));
        stack.push(
            &mut ctx,
            AsyncEntry::internal("reissue", |ctx, _rc, stack, _entry| {
                stack.ensure_on_heap(ctx);
                Step::Deferred
            }),
        );

        let rc = complete_async_data(&mut ctx, ReturnCode::Ok, &mut stack);
        assert_eq!(rc, ReturnCode::AsyncCompletion);
        assert_eq!(calls.counts(), [0, 0, 0, 0]);
        assert_eq!(stack.used(), 1);
        assert!(stack.is_on_heap());

        let heap = stack.ensure_on_heap(&mut ctx);
        let rc = heap.complete(&mut ctx, ReturnCode::Ok);
        assert_eq!(rc, ReturnCode::Ok);
        assert_eq!(calls.counts(), [1, 0, 0, 1]);
    }

    #[test]
    fn test_external_entry_mid_stack() {
        let mut ctx = EngineContext::new("driver");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut stack = AsyncStack::new();

        stack.push(
            &mut ctx,
            AsyncEntry::external("notify", move |rc, _handle, payload| {
                sink.lock().push((rc, payload));
            })
            .with_payload(b"abc"),
        );

        let rc = complete_async_data(&mut ctx, ReturnCode::Failure, &mut stack);
        assert_eq!(rc, ReturnCode::Failure);
        assert_eq!(
            *received.lock(),
            vec![(ReturnCode::Failure, Bytes::from_static(b"abc"))]
        );
    }
}
