use uuid::Uuid;

/// Per-context counters, useful when diagnosing where completions ran
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    pub stack_pushes: u64,
    pub stack_pops: u64,
    pub heap_promotions: u64,
    pub completions_driven: u64,
    pub callbacks_invoked: u64,
}

/// Explicit execution context handed to every engine operation.
///
/// Each thread entering the engine (a caller thread, a delivery thread, an
/// I/O completion worker) owns one and passes it down by `&mut`. Nothing in
/// the engine reaches for ambient per-thread or process-wide state.
#[derive(Debug)]
pub struct EngineContext {
    id: Uuid,
    name: String,
    client_id: Option<String>,
    stats: ContextStats,
}

impl EngineContext {
    pub fn new(name: impl Into<String>) -> Self {
        EngineContext {
            id: Uuid::new_v4(),
            name: name.into(),
            client_id: None,
            stats: ContextStats::default(),
        }
    }

    /// Context for work done on behalf of a particular client
    pub fn for_client(name: impl Into<String>, client_id: impl Into<String>) -> Self {
        let mut ctx = Self::new(name);
        ctx.client_id = Some(client_id.into());
        ctx
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ContextStats {
        &mut self.stats
    }
}
