use crate::config::{EngineConfig, StoreMode};
use crate::metrics::EngineMetrics;
use dashmap::DashMap;
use msgq_async::{
    commit_step, AsyncCommitter, AsyncEntry, AsyncStack, CommitObserver, CommitStep, CommitStore,
    SyncStore,
};
use msgq_core::{ConsumerHandle, EngineContext, EngineError, Result, ReturnCode};
use msgq_waiter::{
    CompleteOptions, DeliveryQueue, EnableOptions, EnableOutcome, Waiter, WaiterRegistry,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Entry point bundling configuration, the commit store, metrics and the
/// per-queue waiter registries
pub struct Engine {
    config: EngineConfig,
    metrics: Option<Arc<EngineMetrics>>,
    store: Arc<dyn CommitStore>,
    committer: Option<Arc<AsyncCommitter>>,
    queues: DashMap<String, Arc<WaiterRegistry>>,
}

impl Engine {
    /// Build an engine; deferred store mode uses the current tokio runtime
    pub fn new(config: EngineConfig) -> Result<Self> {
        match config.store.mode {
            StoreMode::Sync => Self::build(config, None),
            StoreMode::Deferred => {
                let runtime = Handle::try_current().map_err(|_| {
                    EngineError::InvalidConfig(
                        "deferred store mode needs a tokio runtime".to_string(),
                    )
                })?;
                Self::build(config, Some(&runtime))
            }
        }
    }

    /// Build an engine whose deferred committer runs on `runtime`
    pub fn with_runtime(config: EngineConfig, runtime: &Handle) -> Result<Self> {
        Self::build(config, Some(runtime))
    }

    fn build(config: EngineConfig, runtime: Option<&Handle>) -> Result<Self> {
        config.validate()?;

        let metrics = if config.monitoring.metrics_enabled {
            let metrics = EngineMetrics::new().map_err(crate::MetricsError::from)?;
            Some(Arc::new(metrics))
        } else {
            None
        };

        let (store, committer): (Arc<dyn CommitStore>, Option<Arc<AsyncCommitter>>) =
            match (config.store.mode, runtime) {
                (StoreMode::Deferred, Some(runtime)) => {
                    let committer_config = config.to_committer_config()?;
                    let committer = match &metrics {
                        Some(metrics) => AsyncCommitter::start_with_observer(
                            runtime,
                            committer_config,
                            metrics.clone() as Arc<dyn CommitObserver>,
                        ),
                        None => AsyncCommitter::start(runtime, committer_config),
                    };
                    let committer = Arc::new(committer);
                    (committer.clone(), Some(committer))
                }
                _ => (Arc::new(SyncStore::new(config.store_result()?)), None),
            };

        info!(
            "Engine started with {:?} store, metrics {}",
            config.store.mode,
            if metrics.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Engine {
            config,
            metrics,
            store,
            committer,
            queues: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&EngineMetrics> {
        self.metrics.as_deref()
    }

    /// New stack sized from configuration
    pub fn new_stack(&self) -> AsyncStack {
        AsyncStack::with_config(self.config.to_stack_config())
    }

    /// New stack whose final completion reports to `caller`
    pub fn new_stack_with_caller(&self, caller: AsyncEntry) -> AsyncStack {
        AsyncStack::with_caller(self.config.to_stack_config(), caller)
    }

    /// Push `entry`, commit through the configured store, pop it back if the commit finished inline
    pub fn commit_step(
        &self,
        ctx: &mut EngineContext,
        stack: &mut AsyncStack,
        entry: AsyncEntry,
    ) -> CommitStep {
        commit_step(ctx, stack, self, entry)
    }

    /// Waiter registry of a queue, created on first use
    pub fn registry(&self, queue_name: &str) -> Arc<WaiterRegistry> {
        self.queues
            .entry(queue_name.to_string())
            .or_insert_with(|| Arc::new(WaiterRegistry::new(queue_name)))
            .clone()
    }

    /// Create and attach the waiter for a new consumer
    pub fn attach_consumer(
        &self,
        consumer: &ConsumerHandle,
        queue: Arc<dyn DeliveryQueue>,
    ) -> Result<Arc<Waiter>> {
        let waiter = Arc::new(Waiter::new(consumer, queue));
        self.registry(consumer.queue_name()).attach(waiter.clone())?;
        if let Some(metrics) = &self.metrics {
            metrics.waiters_attached.inc();
        }
        Ok(waiter)
    }

    /// Detach a consumer's waiter; `AsyncCompletion` if the waiter is locked
    pub fn detach_consumer(
        &self,
        ctx: &mut EngineContext,
        consumer: &ConsumerHandle,
    ) -> Result<ReturnCode> {
        let registry = self
            .queues
            .get(consumer.queue_name())
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::WaiterNotFound(consumer.id().to_string()))?;
        let result = registry.detach(ctx, consumer);
        if !matches!(result, Err(EngineError::WaiterNotFound(_))) {
            if let Some(metrics) = &self.metrics {
                metrics.waiters_attached.dec();
            }
        }
        let rc = result?;
        self.record("terminate", rc);
        Ok(rc)
    }

    pub fn enable_waiter(
        &self,
        ctx: &mut EngineContext,
        waiter: &Waiter,
        consumer: ConsumerHandle,
        options: EnableOptions,
    ) -> EnableOutcome {
        let outcome = waiter.enable_waiter(ctx, consumer, options);
        self.record("enable", outcome.rc());
        outcome
    }

    pub fn disable_waiter(&self, ctx: &mut EngineContext, waiter: &Waiter) -> ReturnCode {
        let rc = waiter.disable_waiter(ctx);
        self.record("disable", rc);
        rc
    }

    pub fn complete_waiter_actions(
        &self,
        ctx: &mut EngineContext,
        waiter: &Waiter,
        options: CompleteOptions,
    ) -> ReturnCode {
        let rc = waiter.complete_waiter_actions(ctx, options);
        self.record("complete", rc);
        rc
    }

    /// Stop the background committer, completing every deferred commit first
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(committer) = &self.committer {
            committer.shutdown().await?;
        }
        info!("Engine stopped");
        Ok(())
    }

    fn record(&self, op: &str, rc: ReturnCode) {
        debug!("Waiter {} returned {}", op, rc);
        if let Some(metrics) = &self.metrics {
            metrics.record_waiter_op(op, rc);
        }
    }
}

impl CommitStore for Engine {
    fn commit(&self, ctx: &mut EngineContext, stack: &mut AsyncStack) -> ReturnCode {
        let rc = self.store.commit(ctx, stack);
        if let Some(metrics) = &self.metrics {
            metrics.record_commit(rc);
        }
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgq_async::Step;
    use msgq_core::{Consumer, NoopListener, Session};
    use msgq_waiter::{LockKind, WaiterState};

    struct IdleQueue;

    impl DeliveryQueue for IdleQueue {
        fn check_waiters(&self, _ctx: &mut EngineContext) -> ReturnCode {
            ReturnCode::Ok
        }
    }

    #[test]
    fn test_sync_engine_commit_step() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut ctx = EngineContext::new("test");
        let mut stack = engine.new_stack();

        let step = engine.commit_step(
            &mut ctx,
            &mut stack,
            AsyncEntry::internal("put", |_ctx, rc, _stack, _entry| Step::Continue(rc)),
        );

        assert_eq!(step.rc(), ReturnCode::Ok);
        assert!(stack.is_empty());
        let metrics = engine.metrics().unwrap();
        assert_eq!(metrics.commits_total.with_label_values(&["inline"]).get(), 1);
    }

    #[test]
    fn test_deferred_mode_needs_runtime() {
        let mut config = EngineConfig::default();
        config.store.mode = StoreMode::Deferred;
        assert!(matches!(
            Engine::new(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_attach_enable_detach() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut ctx = EngineContext::new("test");
        let session = Arc::new(Session::new("client-1"));
        let consumer = ConsumerHandle::new(Consumer::new("Q1", session, Arc::new(NoopListener)));

        let waiter = engine.attach_consumer(&consumer, Arc::new(IdleQueue)).unwrap();
        let outcome = engine.enable_waiter(&mut ctx, &waiter, consumer.clone(), EnableOptions::default());
        assert_eq!(outcome.rc(), ReturnCode::Ok);
        assert_eq!(engine.metrics().unwrap().waiters_attached.get(), 1);

        assert!(waiter.try_lock(LockKind::Getting));
        assert_eq!(
            engine.detach_consumer(&mut ctx, &consumer).unwrap(),
            ReturnCode::AsyncCompletion
        );
        let rc = engine.complete_waiter_actions(&mut ctx, &waiter, CompleteOptions::default());
        assert_eq!(rc, ReturnCode::WaiterRemoved);
        assert_eq!(waiter.state(), WaiterState::Disconnected);
        assert_eq!(consumer.use_count(), 1);

        assert_eq!(engine.disable_waiter(&mut ctx, &waiter), ReturnCode::WaiterInvalid);
        assert!(matches!(
            engine.detach_consumer(&mut ctx, &consumer),
            Err(EngineError::WaiterNotFound(_))
        ));

        let metrics = engine.metrics().unwrap();
        assert_eq!(metrics.waiters_attached.get(), 0);
        assert_eq!(
            metrics
                .waiter_operations_total
                .with_label_values(&["enable", "ok"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .waiter_operations_total
                .with_label_values(&["terminate", "async_completion"])
                .get(),
            1
        );
    }
}
