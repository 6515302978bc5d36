use msgq_async::CommitObserver;
use msgq_core::ReturnCode;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the engine
pub struct EngineMetrics {
    pub registry: Registry,

    // Commits by outcome
    pub commits_total: IntCounterVec,

    // Deferred commits driven to completion
    pub async_completions_total: IntCounter,
    pub commit_batch_size: Histogram,

    // Waiter operations by result
    pub waiter_operations_total: IntCounterVec,
    pub waiters_attached: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let commits_total = IntCounterVec::new(
            Opts::new("msgq_commits_total", "Total number of commits by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(commits_total.clone()))?;

        let async_completions_total = IntCounter::new(
            "msgq_async_completions_total",
            "Deferred commits driven to completion",
        )?;
        registry.register(Box::new(async_completions_total.clone()))?;

        let commit_batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "msgq_commit_batch_size",
                "Deferred commits completed per committer wakeup",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )?;
        registry.register(Box::new(commit_batch_size.clone()))?;

        let waiter_operations_total = IntCounterVec::new(
            Opts::new(
                "msgq_waiter_operations_total",
                "Waiter operations by operation and return code",
            ),
            &["op", "rc"],
        )?;
        registry.register(Box::new(waiter_operations_total.clone()))?;

        let waiters_attached = IntGauge::new("msgq_waiters_attached", "Number of attached waiters")?;
        registry.register(Box::new(waiters_attached.clone()))?;

        Ok(EngineMetrics {
            registry,
            commits_total,
            async_completions_total,
            commit_batch_size,
            waiter_operations_total,
            waiters_attached,
        })
    }

    /// Count a commit by whether it completed inline, deferred or failed
    pub fn record_commit(&self, rc: ReturnCode) {
        let outcome = if rc.is_async() {
            "deferred"
        } else if rc.is_failure() {
            "failed"
        } else {
            "inline"
        };
        self.commits_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_waiter_op(&self, op: &str, rc: ReturnCode) {
        self.waiter_operations_total
            .with_label_values(&[op, rc.as_str()])
            .inc();
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl CommitObserver for EngineMetrics {
    fn completion_driven(&self, _rc: ReturnCode) {
        self.async_completions_total.inc();
    }

    fn batch_completed(&self, size: usize) {
        self.commit_batch_size.observe(size as f64);
    }
}
