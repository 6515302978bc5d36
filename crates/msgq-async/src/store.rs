use crate::driver::complete_async_data;
use crate::stack::{AsyncEntry, AsyncStack, HeapStack, PoppedEntry};
use crate::{Result, StoreError};
use msgq_core::{EngineContext, ReturnCode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Persistence seam used by every layer that issues a commit.
///
/// A store either finishes the commit inline and returns its final code, or
/// promotes `stack` to the heap, keeps the heap copy, and returns
/// `AsyncCompletion`. In the second case the store later runs
/// [`complete_async_data`] on the heap copy with the eventual result.
pub trait CommitStore: Send + Sync {
    fn commit(&self, ctx: &mut EngineContext, stack: &mut AsyncStack) -> ReturnCode;
}

/// Store that completes every commit inline
#[derive(Debug, Clone, Copy)]
pub struct SyncStore {
    result: ReturnCode,
}

impl SyncStore {
    pub fn new(result: ReturnCode) -> Self {
        SyncStore { result }
    }
}

impl Default for SyncStore {
    fn default() -> Self {
        SyncStore::new(ReturnCode::Ok)
    }
}

impl CommitStore for SyncStore {
    fn commit(&self, _ctx: &mut EngineContext, _stack: &mut AsyncStack) -> ReturnCode {
        self.result
    }
}

/// Result of the push / commit / pop pattern
#[derive(Debug)]
pub enum CommitStep {
    /// The commit finished inline; the layer's own entry has been popped back
    Completed { rc: ReturnCode, entry: PoppedEntry },
    /// The commit was deferred; the entry stays on the (now heap) stack
    Deferred,
}

impl CommitStep {
    pub fn rc(&self) -> ReturnCode {
        match self {
            CommitStep::Completed { rc, .. } => *rc,
            CommitStep::Deferred => ReturnCode::AsyncCompletion,
        }
    }
}

/// Push `entry`, commit, and pop the entry again if the commit did not defer
pub fn commit_step(
    ctx: &mut EngineContext,
    stack: &mut AsyncStack,
    store: &dyn CommitStore,
    entry: AsyncEntry,
) -> CommitStep {
    let len = entry.payload_len();
    stack.push(ctx, entry);

    let rc = store.commit(ctx, stack);
    if rc.is_async() {
        return CommitStep::Deferred;
    }

    let entry = stack.pop(len);
    ctx.stats_mut().stack_pops += 1;
    CommitStep::Completed { rc, entry }
}

/// Hooks for watching the background committer
pub trait CommitObserver: Send + Sync {
    /// A deferred commit has been driven to completion; `rc` is what the stack returned
    fn completion_driven(&self, _rc: ReturnCode) {}

    /// A batch of deferred commits has been taken off the queue
    fn batch_completed(&self, _size: usize) {}
}

struct NoopObserver;

impl CommitObserver for NoopObserver {}

/// Background committer configuration
#[derive(Debug, Clone, Copy)]
pub struct CommitterConfig {
    /// Most deferred commits completed per wakeup
    pub max_batch: usize,
    /// Code every deferred commit completes with
    pub result: ReturnCode,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        CommitterConfig {
            max_batch: 64,
            result: ReturnCode::Ok,
        }
    }
}

struct PendingCommit {
    stack: HeapStack,
}

/// Commit store that defers every commit to a tokio task.
///
/// Each commit promotes the caller's stack and queues the heap copy; the
/// worker completes queued stacks in batches on a runtime thread. On
/// shutdown the worker drains everything still queued, so every deferred
/// commit is completed exactly once.
pub struct AsyncCommitter {
    sender: mpsc::UnboundedSender<PendingCommit>,
    shutdown: Arc<Notify>,
    outstanding: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: CommitterConfig,
}

impl AsyncCommitter {
    pub fn start(runtime: &Handle, config: CommitterConfig) -> Self {
        Self::start_with_observer(runtime, config, Arc::new(NoopObserver))
    }

    pub fn start_with_observer(
        runtime: &Handle,
        config: CommitterConfig,
        observer: Arc<dyn CommitObserver>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let outstanding = Arc::new(AtomicUsize::new(0));

        let worker = runtime.spawn(run_committer(
            receiver,
            shutdown.clone(),
            outstanding.clone(),
            config,
            observer,
        ));

        info!(
            "Started async committer (max batch {}, result {})",
            config.max_batch, config.result
        );

        AsyncCommitter {
            sender,
            shutdown,
            outstanding,
            worker: Mutex::new(Some(worker)),
            config,
        }
    }

    /// Deferred commits queued but not yet completed
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Stop the worker after it has completed everything already queued
    pub async fn shutdown(&self) -> Result<()> {
        let worker = self.worker.lock().take().ok_or(StoreError::Stopped)?;
        self.shutdown.notify_one();
        worker
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?;
        info!("Async committer stopped");
        Ok(())
    }
}

impl CommitStore for AsyncCommitter {
    fn commit(&self, ctx: &mut EngineContext, stack: &mut AsyncStack) -> ReturnCode {
        let heap = stack.ensure_on_heap(ctx);
        let address = heap.address();

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        match self.sender.send(PendingCommit { stack: heap }) {
            Ok(()) => {
                debug!("Deferred commit for stack {:#x}", address);
                ReturnCode::AsyncCompletion
            }
            Err(_) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                warn!(
                    "Committer stopped, completing commit for stack {:#x} inline",
                    address
                );
                self.config.result
            }
        }
    }
}

async fn run_committer(
    mut receiver: mpsc::UnboundedReceiver<PendingCommit>,
    shutdown: Arc<Notify>,
    outstanding: Arc<AtomicUsize>,
    config: CommitterConfig,
    observer: Arc<dyn CommitObserver>,
) {
    let mut ctx = EngineContext::new("commit-worker");
    let max_batch = config.max_batch.max(1);

    loop {
        tokio::select! {
            received = receiver.recv() => {
                let Some(first) = received else {
                    debug!("Commit queue closed");
                    break;
                };

                let mut batch = vec![first];
                while batch.len() < max_batch {
                    match receiver.try_recv() {
                        Ok(pending) => batch.push(pending),
                        Err(_) => break,
                    }
                }

                let size = batch.len();
                for pending in batch {
                    complete_pending(&mut ctx, pending, &config, &outstanding, observer.as_ref());
                }
                observer.batch_completed(size);
            }
            _ = shutdown.notified() => {
                receiver.close();
                let mut drained = 0usize;
                while let Some(pending) = receiver.recv().await {
                    complete_pending(&mut ctx, pending, &config, &outstanding, observer.as_ref());
                    drained += 1;
                }
                if drained > 0 {
                    info!("Drained {} deferred commits on shutdown", drained);
                    observer.batch_completed(drained);
                }
                break;
            }
        }
    }
}

fn complete_pending(
    ctx: &mut EngineContext,
    pending: PendingCommit,
    config: &CommitterConfig,
    outstanding: &AtomicUsize,
    observer: &dyn CommitObserver,
) {
    let rc = pending.stack.complete(ctx, config.result);
    outstanding.fetch_sub(1, Ordering::AcqRel);
    observer.completion_driven(rc);
}
