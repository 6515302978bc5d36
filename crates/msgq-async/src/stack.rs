use bytes::{Bytes, BytesMut};
use msgq_core::{EngineContext, ReturnCode};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

pub const DEFAULT_INITIAL_ENTRIES: usize = 8;
pub const DEFAULT_INITIAL_PAYLOAD_BYTES: usize = 512;

/// Opaque correlation handle carried by an entry, or handed to the caller entry
pub type AsyncHandle = Arc<dyn Any + Send + Sync>;

/// What an internal continuation tells the driver once it has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Carry on unwinding with this return code
    Continue(ReturnCode),
    /// The continuation issued more deferred I/O; a later completion resumes the stack
    Deferred,
}

pub type InternalFn =
    Box<dyn FnOnce(&mut EngineContext, ReturnCode, &mut AsyncStack, PoppedEntry) -> Step + Send>;

pub type ExternalFn = Box<dyn FnOnce(ReturnCode, Option<AsyncHandle>, Bytes) + Send>;

/// Completion function of an entry
pub enum Continuation {
    /// Engine-internal step: sees the whole stack and may push further entries
    Internal(InternalFn),
    /// Caller-facing callback: sees only the return code, handle and context bytes
    External(ExternalFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Internal,
    External,
}

impl Continuation {
    pub fn kind(&self) -> EntryKind {
        match self {
            Continuation::Internal(_) => EntryKind::Internal,
            Continuation::External(_) => EntryKind::External,
        }
    }
}

/// A pending-completion entry, as handed to [`AsyncStack::push`]
pub struct AsyncEntry {
    tag: &'static str,
    handle: Option<AsyncHandle>,
    payload: Bytes,
    continuation: Continuation,
}

impl AsyncEntry {
    pub fn internal<F>(tag: &'static str, f: F) -> Self
    where
        F: FnOnce(&mut EngineContext, ReturnCode, &mut AsyncStack, PoppedEntry) -> Step
            + Send
            + 'static,
    {
        AsyncEntry {
            tag,
            handle: None,
            payload: Bytes::new(),
            continuation: Continuation::Internal(Box::new(f)),
        }
    }

    pub fn external<F>(tag: &'static str, f: F) -> Self
    where
        F: FnOnce(ReturnCode, Option<AsyncHandle>, Bytes) + Send + 'static,
    {
        AsyncEntry {
            tag,
            handle: None,
            payload: Bytes::new(),
            continuation: Continuation::External(Box::new(f)),
        }
    }

    /// Attach a payload; the bytes are copied
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = Bytes::copy_from_slice(payload);
        self
    }

    pub fn with_handle(mut self, handle: AsyncHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn kind(&self) -> EntryKind {
        self.continuation.kind()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

impl fmt::Debug for AsyncEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEntry")
            .field("tag", &self.tag)
            .field("kind", &self.kind())
            .field("payload_len", &self.payload.len())
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// An entry after it has been removed from the stack
pub struct PoppedEntry {
    pub id: u64,
    pub tag: &'static str,
    pub kind: EntryKind,
    pub handle: Option<AsyncHandle>,
    pub payload: Bytes,
}

impl fmt::Debug for PoppedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoppedEntry")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Read-only snapshot of an entry still on the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    pub id: u64,
    pub tag: &'static str,
    pub kind: EntryKind,
    pub has_handle: bool,
    pub payload: Bytes,
}

/// Initial sizing of a new stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub initial_entries: usize,
    pub initial_payload_bytes: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            initial_entries: DEFAULT_INITIAL_ENTRIES,
            initial_payload_bytes: DEFAULT_INITIAL_PAYLOAD_BYTES,
        }
    }
}

struct Slot {
    id: u64,
    tag: &'static str,
    handle: Option<AsyncHandle>,
    offset: usize,
    len: usize,
    continuation: Continuation,
}

struct CallerSlot {
    tag: &'static str,
    payload: Bytes,
    callback: ExternalFn,
}

/// Storage shared by the frame-resident and heap-resident forms
struct ActionList {
    slots: Vec<Slot>,
    allocated: usize,
    arena: BytesMut,
    caller: Option<CallerSlot>,
    caller_handle: Option<AsyncHandle>,
    next_id: u64,
    on_heap: bool,
}

impl ActionList {
    fn with_config(config: StackConfig) -> Self {
        let allocated = config.initial_entries.max(1);
        ActionList {
            slots: Vec::with_capacity(allocated),
            allocated,
            arena: BytesMut::with_capacity(config.initial_payload_bytes),
            caller: None,
            caller_handle: None,
            next_id: 0,
            on_heap: false,
        }
    }

    /// Placeholder left behind while the real list moves to the heap
    fn detached() -> Self {
        ActionList {
            slots: Vec::new(),
            allocated: 0,
            arena: BytesMut::new(),
            caller: None,
            caller_handle: None,
            next_id: 0,
            on_heap: false,
        }
    }

    fn push(&mut self, entry: AsyncEntry) -> u64 {
        if self.slots.len() == self.allocated {
            let grown = (self.allocated * 2).max(1);
            self.slots.reserve_exact(grown - self.slots.len());
            self.allocated = grown;
        }

        let needed = entry.payload.len();
        if self.arena.capacity() - self.arena.len() < needed {
            let extra = needed.max(self.arena.capacity());
            self.arena.reserve(extra);
        }

        let offset = self.arena.len();
        self.arena.extend_from_slice(&entry.payload);

        let id = self.next_id;
        self.next_id += 1;

        self.slots.push(Slot {
            id,
            tag: entry.tag,
            handle: entry.handle,
            offset,
            len: needed,
            continuation: entry.continuation,
        });
        id
    }

    fn pop(&mut self, consumed_len: usize) -> (PoppedEntry, Continuation) {
        let slot = match self.slots.pop() {
            Some(slot) => slot,
            None => {
                error!("Pop requested on an empty async stack");
                panic!("async stack underflow");
            }
        };

        if slot.len != consumed_len {
            error!(
                "Async stack entry '{}' holds {} payload bytes but pop consumed {}",
                slot.tag, slot.len, consumed_len
            );
            panic!(
                "async stack payload mismatch on '{}': {} != {}",
                slot.tag, slot.len, consumed_len
            );
        }
        debug_assert_eq!(slot.offset + slot.len, self.arena.len());

        let payload = Bytes::copy_from_slice(&self.arena[slot.offset..]);
        self.arena.truncate(slot.offset);

        let kind = slot.continuation.kind();
        let popped = PoppedEntry {
            id: slot.id,
            tag: slot.tag,
            kind,
            handle: slot.handle,
            payload,
        };
        (popped, slot.continuation)
    }

    fn take_top(&mut self) -> Option<(PoppedEntry, Continuation)> {
        let len = self.slots.last()?.len;
        Some(self.pop(len))
    }

    fn view(&self, index: usize) -> Option<EntryView> {
        let slot = self.slots.get(index)?;
        Some(EntryView {
            id: slot.id,
            tag: slot.tag,
            kind: slot.continuation.kind(),
            has_handle: slot.handle.is_some(),
            payload: Bytes::copy_from_slice(&self.arena[slot.offset..slot.offset + slot.len]),
        })
    }
}

/// Stack promoted to the heap; clones refer to the same stack
#[derive(Clone)]
pub struct HeapStack {
    list: Arc<Mutex<ActionList>>,
}

impl HeapStack {
    /// Address of the heap allocation, stable for the life of the stack
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.list) as *const () as usize
    }

    pub fn used(&self) -> usize {
        self.list.lock().slots.len()
    }

    pub fn allocated(&self) -> usize {
        self.list.lock().allocated
    }

    /// Reopen the heap stack for pushing, popping or driving
    pub fn into_stack(self) -> AsyncStack {
        AsyncStack {
            repr: Repr::Heap(self),
        }
    }
}

impl fmt::Debug for HeapStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapStack")
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

enum Repr {
    Frame(ActionList),
    Heap(HeapStack),
}

/// Ordered stack of pending completions for one in-flight compound operation.
///
/// A stack starts out owned by the top-level call frame. Each layer that is
/// about to issue possibly-deferred I/O pushes an entry; when the I/O turns
/// out to be deferred the stack is promoted with [`AsyncStack::ensure_on_heap`]
/// and the heap copy travels with the I/O, to be unwound later by
/// [`crate::complete_async_data`]. After promotion this value only forwards to
/// the heap copy.
pub struct AsyncStack {
    repr: Repr,
}

impl AsyncStack {
    pub fn new() -> Self {
        Self::with_config(StackConfig::default())
    }

    pub fn with_config(config: StackConfig) -> Self {
        AsyncStack {
            repr: Repr::Frame(ActionList::with_config(config)),
        }
    }

    /// New stack whose final completion reports to `caller`
    pub fn with_caller(config: StackConfig, caller: AsyncEntry) -> Self {
        let mut stack = Self::with_config(config);
        stack.set_caller(caller);
        stack
    }

    fn write<R>(&mut self, f: impl FnOnce(&mut ActionList) -> R) -> R {
        match &mut self.repr {
            Repr::Frame(list) => f(list),
            Repr::Heap(heap) => f(&mut heap.list.lock()),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&ActionList) -> R) -> R {
        match &self.repr {
            Repr::Frame(list) => f(list),
            Repr::Heap(heap) => f(&heap.list.lock()),
        }
    }

    /// Designate the entry that runs last and reports to the top-level API caller
    pub fn set_caller(&mut self, caller: AsyncEntry) {
        let AsyncEntry {
            tag,
            handle,
            payload,
            continuation,
        } = caller;

        let callback = match continuation {
            Continuation::External(callback) => callback,
            Continuation::Internal(_) => {
                error!("Caller entry '{}' must be caller-facing", tag);
                panic!("caller entry '{}' is not an external entry", tag);
            }
        };

        self.write(|list| {
            if handle.is_some() {
                list.caller_handle = handle;
            }
            list.caller = Some(CallerSlot {
                tag,
                payload,
                callback,
            });
        });
    }

    /// Record the handle the caller entry will be given
    pub fn set_caller_handle(&mut self, handle: AsyncHandle) {
        self.write(|list| list.caller_handle = Some(handle));
    }

    /// Push an entry above the current top, copying its payload into the stack
    pub fn push(&mut self, ctx: &mut EngineContext, entry: AsyncEntry) {
        let tag = entry.tag;
        let id = self.write(|list| list.push(entry));
        ctx.stats_mut().stack_pushes += 1;
        debug!("Pushed async entry '{}' (#{}), {} in use", tag, id, self.used());
    }

    /// Remove the top entry without running it.
    ///
    /// `consumed_len` must equal the payload length the entry was pushed with.
    pub fn pop(&mut self, consumed_len: usize) -> PoppedEntry {
        let (popped, _continuation) = self.write(|list| list.pop(consumed_len));
        popped
    }

    pub(crate) fn take_top(&mut self) -> Option<(PoppedEntry, Continuation)> {
        self.write(|list| list.take_top())
    }

    pub(crate) fn take_caller(&mut self) -> Option<(&'static str, ExternalFn, Option<AsyncHandle>, Bytes)> {
        self.write(|list| {
            let caller = list.caller.take()?;
            let handle = list.caller_handle.take();
            Some((caller.tag, caller.callback, handle, caller.payload))
        })
    }

    /// Move the stack to the heap, or return the existing heap copy.
    ///
    /// Calling this again returns the same allocation with the same counts.
    pub fn ensure_on_heap(&mut self, ctx: &mut EngineContext) -> HeapStack {
        let mut list = match std::mem::replace(&mut self.repr, Repr::Frame(ActionList::detached())) {
            Repr::Frame(list) => list,
            Repr::Heap(heap) => {
                self.repr = Repr::Heap(heap.clone());
                return heap;
            }
        };

        list.on_heap = true;
        let used = list.slots.len();
        let heap = HeapStack {
            list: Arc::new(Mutex::new(list)),
        };
        self.repr = Repr::Heap(heap.clone());

        ctx.stats_mut().heap_promotions += 1;
        debug!(
            "Promoted async stack to heap at {:#x} with {} entries",
            heap.address(),
            used
        );
        heap
    }

    pub fn used(&self) -> usize {
        self.read(|list| list.slots.len())
    }

    pub fn allocated(&self) -> usize {
        self.read(|list| list.allocated)
    }

    /// Bytes of payload currently held for all entries
    pub fn payload_len(&self) -> usize {
        self.read(|list| list.arena.len())
    }

    pub fn is_on_heap(&self) -> bool {
        self.read(|list| list.on_heap)
    }

    pub fn has_caller(&self) -> bool {
        self.read(|list| list.caller.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Snapshot of the entry at `index`, counted from the bottom of the stack
    pub fn entry(&self, index: usize) -> Option<EntryView> {
        self.read(|list| list.view(index))
    }

    pub fn top(&self) -> Option<EntryView> {
        self.read(|list| list.slots.len().checked_sub(1).and_then(|i| list.view(i)))
    }
}

impl Default for AsyncStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.read(|list| {
            f.debug_struct("AsyncStack")
                .field("used", &list.slots.len())
                .field("allocated", &list.allocated)
                .field("payload_len", &list.arena.len())
                .field("on_heap", &list.on_heap)
                .field("caller", &list.caller.as_ref().map(|c| c.tag))
                .finish()
        })
    }
}
