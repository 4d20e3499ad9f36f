//! A reusable isolate plus its live context.

use std::sync::{
    atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
    Arc,
};

use anyhow::Context as _;
use errors::SandboxError;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    guest::{
        ContextOf,
        GuestEngine,
        GuestIsolate,
    },
    manager::IsolateManager,
};

/// One pooled isolate. The context is released and re-created on every
/// `reset`, so global pollution from a prior run cannot leak into the next.
pub struct PooledIsolate<E: GuestEngine> {
    id: String,
    isolate: Arc<E::Isolate>,
    context: Mutex<Option<ContextOf<E>>>,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    execution_count: AtomicU64,
    healthy: AtomicBool,
    memory_limit_bytes: u64,
}

impl<E: GuestEngine> std::fmt::Debug for PooledIsolate<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledIsolate")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("execution_count", &self.execution_count)
            .field("healthy", &self.healthy)
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .finish_non_exhaustive()
    }
}

impl<E: GuestEngine> PooledIsolate<E> {
    /// Create a fresh isolate with an initial context, tracked by `manager`.
    pub fn create(
        manager: &IsolateManager<E>,
        memory_limit_bytes: u64,
    ) -> anyhow::Result<Self> {
        let (id, isolate) = manager.create(Some(memory_limit_bytes))?;
        let context = isolate
            .create_context()
            .map_err(|e| SandboxError::context_setup_failed(format!("{e:#}")))?;
        let now = Instant::now();
        Ok(Self {
            id,
            isolate,
            context: Mutex::new(Some(context)),
            created_at: now,
            last_used_at: Mutex::new(now),
            execution_count: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            memory_limit_bytes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn isolate(&self) -> &Arc<E::Isolate> {
        &self.isolate
    }

    /// A handle to the current context. Fails if the context was lost to a
    /// failed reset.
    pub fn context(&self) -> Result<ContextOf<E>, SandboxError> {
        self.context.lock().clone().ok_or_else(|| {
            SandboxError::context_setup_failed(format!("Isolate {} has no live context", self.id))
        })
    }

    /// Replace the context with a fresh one. A disposed isolate or a failed
    /// context creation marks the instance unhealthy.
    pub fn reset(&self) -> anyhow::Result<()> {
        if self.isolate.is_disposed() {
            self.healthy.store(false, Ordering::SeqCst);
            anyhow::bail!(SandboxError::context_setup_failed(format!(
                "Isolate {} was disposed; cannot reset",
                self.id
            )));
        }
        let old = self.context.lock().take();
        if let Some(old) = old {
            self.isolate.release_context(old);
        }
        let fresh = self
            .isolate
            .create_context()
            .map_err(|e| {
                self.healthy.store(false, Ordering::SeqCst);
                anyhow::anyhow!(e)
            })
            .with_context(|| format!("Recreating context for isolate {}", self.id))?;
        *self.context.lock() = Some(fresh);
        Ok(())
    }

    pub fn mark_used(&self) {
        *self.last_used_at.lock() = Instant::now();
        self.execution_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.isolate.is_disposed()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> std::time::Duration {
        self.last_used_at.lock().elapsed()
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::SeqCst)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    /// Best-effort teardown; always leaves the instance unhealthy.
    pub fn dispose(&self) {
        if let Some(context) = self.context.lock().take() {
            self.isolate.release_context(context);
        }
        if !self.isolate.is_disposed() {
            self.isolate.dispose();
        }
        self.healthy.store(false, Ordering::SeqCst);
    }
}
