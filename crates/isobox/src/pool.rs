//! Bounded pool of reusable isolates.
//!
//! Acquisition is gated through the async queue with capacity `max`; the
//! queue slot is held until release, which is what makes the `PoolExhausted`
//! arm of `acquire` a defensive assertion rather than a reachable path.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Weak,
    },
    time::Duration,
};

use errors::{
    ErrorCode,
    SandboxError,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    engine::{
        CompiledScript,
        ExecuteOptions,
        ExecutionEngine,
        ExecutionResult,
    },
    guest::GuestEngine,
    knobs::POOL_IDLE_TIMEOUT_MS,
    manager::IsolateManager,
    pooled::PooledIsolate,
    queue::{
        AsyncQueue,
        SlotGuard,
    },
};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    /// Idle time after which the reaper may evict, provided the pool stays
    /// at or above `min`.
    pub idle_timeout: Duration,
    /// Optionally compiled and run in each isolate during warmup to prime
    /// engine caches.
    pub warmup_code: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            idle_timeout: Duration::from_millis(*POOL_IDLE_TIMEOUT_MS),
            warmup_code: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.min < 1 {
            return Err(SandboxError::invalid_config(format!(
                "Pool min must be at least 1, got {}",
                self.min
            )));
        }
        if self.max < self.min {
            return Err(SandboxError::invalid_config(format!(
                "Pool max ({}) must be at least min ({})",
                self.max, self.min
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub disposed: u64,
    pub reused: u64,
    pub executions: u64,
    pub errors: u64,
    pub reaped: u64,
}

struct InUseEntry<E: GuestEngine> {
    isolate: Arc<PooledIsolate<E>>,
    /// Dropping this hands the pool slot to the next queued acquire.
    _slot: SlotGuard,
}

struct PoolInner<E: GuestEngine> {
    config: PoolConfig,
    memory_limit_bytes: u64,
    manager: IsolateManager<E>,
    execution: ExecutionEngine,
    queue: AsyncQueue,
    available: Mutex<VecDeque<Arc<PooledIsolate<E>>>>,
    in_use: Mutex<HashMap<String, InUseEntry<E>>>,
    disposed: AtomicBool,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stats: Mutex<PoolStats>,
    released: Notify,
}

pub struct IsolatePool<E: GuestEngine> {
    inner: Arc<PoolInner<E>>,
}

impl<E: GuestEngine> std::fmt::Debug for IsolatePool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatePool").finish_non_exhaustive()
    }
}

impl<E: GuestEngine> Clone for IsolatePool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: GuestEngine> IsolatePool<E> {
    pub fn new(
        engine: Arc<E>,
        config: PoolConfig,
        memory_limit_bytes: u64,
        execution: ExecutionEngine,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let queue = AsyncQueue::new(config.max)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                memory_limit_bytes,
                manager: IsolateManager::new(engine),
                execution,
                queue,
                available: Mutex::new(VecDeque::new()),
                in_use: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                reaper: Mutex::new(None),
                stats: Mutex::new(PoolStats::default()),
                released: Notify::new(),
            }),
        })
    }

    pub fn execution(&self) -> &ExecutionEngine {
        &self.inner.execution
    }

    /// FIFO acquisition: reuse an idle isolate after resetting its context,
    /// else create one while under `max`.
    pub async fn acquire(&self) -> anyhow::Result<Arc<PooledIsolate<E>>> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            anyhow::bail!(SandboxError::pool_disposed());
        }
        self.ensure_reaper();
        let slot = match self.inner.queue.acquire().await {
            Ok(slot) => slot,
            Err(err) if err.code == ErrorCode::QueueCleared => {
                anyhow::bail!(SandboxError::pool_disposed())
            },
            Err(err) => anyhow::bail!(err),
        };
        if self.inner.disposed.load(Ordering::SeqCst) {
            anyhow::bail!(SandboxError::pool_disposed());
        }

        loop {
            let candidate = self.inner.available.lock().pop_front();
            let Some(isolate) = candidate else { break };
            match isolate.reset() {
                Ok(()) => {
                    isolate.mark_used();
                    self.inner.stats.lock().reused += 1;
                    self.inner.in_use.lock().insert(
                        isolate.id().to_string(),
                        InUseEntry {
                            isolate: isolate.clone(),
                            _slot: slot,
                        },
                    );
                    return Ok(isolate);
                },
                Err(err) => {
                    tracing::warn!(
                        "Reset of pooled isolate {} failed, replacing it: {err:#}",
                        isolate.id()
                    );
                    self.retire(&isolate);
                },
            }
        }

        if self.inner.in_use.lock().len() >= self.inner.config.max {
            // The queue gate bounds concurrency at max, so this is only
            // reachable on misconfiguration.
            anyhow::bail!(SandboxError::pool_exhausted(self.inner.config.max));
        }
        let isolate = Arc::new(PooledIsolate::create(
            &self.inner.manager,
            self.inner.memory_limit_bytes,
        )?);
        self.inner.stats.lock().created += 1;
        isolate.mark_used();
        self.inner.in_use.lock().insert(
            isolate.id().to_string(),
            InUseEntry {
                isolate: isolate.clone(),
                _slot: slot,
            },
        );
        Ok(isolate)
    }

    /// Return an isolate to the pool: unhealthy ones are disposed, healthy
    /// ones go back to the idle set (unless it is already full).
    pub fn release(&self, isolate: &Arc<PooledIsolate<E>>) {
        let entry = self.inner.in_use.lock().remove(isolate.id());
        if entry.is_none() {
            tracing::warn!("Released isolate {} was not in use", isolate.id());
            return;
        }
        if self.inner.disposed.load(Ordering::SeqCst) || !isolate.is_healthy() {
            self.retire(isolate);
        } else {
            let mut available = self.inner.available.lock();
            if available.len() < self.inner.config.max {
                available.push_back(isolate.clone());
            } else {
                drop(available);
                self.retire(isolate);
            }
        }
        // Dropping the entry's slot wakes the next queued acquire.
        drop(entry);
        self.inner.released.notify_waiters();
    }

    /// Acquire → execute → release, recording stats and marking the isolate
    /// unhealthy on any execution error.
    pub async fn execute(
        &self,
        code: &str,
        options: ExecuteOptions,
    ) -> anyhow::Result<ExecutionResult> {
        let isolate = self.acquire().await?;
        let context = match isolate.context() {
            Ok(context) => context,
            Err(err) => {
                isolate.mark_unhealthy();
                self.release(&isolate);
                return Err(err.into());
            },
        };
        let result = self
            .inner
            .execution
            .execute(code, isolate.isolate(), &context, options)
            .await;
        self.finish_execution(&isolate, &result);
        Ok(result)
    }

    /// As `execute`, but for a pre-compiled script.
    pub async fn execute_script(
        &self,
        compiled: &CompiledScript<E::Isolate>,
        options: ExecuteOptions,
    ) -> anyhow::Result<ExecutionResult> {
        let isolate = self.acquire().await?;
        let context = match isolate.context() {
            Ok(context) => context,
            Err(err) => {
                isolate.mark_unhealthy();
                self.release(&isolate);
                return Err(err.into());
            },
        };
        let result = self
            .inner
            .execution
            .execute_script(compiled, isolate.id(), isolate.isolate(), &context, options)
            .await;
        self.finish_execution(&isolate, &result);
        Ok(result)
    }

    /// Dispose an isolate and drop its tracking entry.
    fn retire(&self, isolate: &Arc<PooledIsolate<E>>) {
        isolate.dispose();
        self.inner.manager.dispose(isolate.id());
        self.inner.stats.lock().disposed += 1;
    }

    fn finish_execution(&self, isolate: &Arc<PooledIsolate<E>>, result: &ExecutionResult) {
        {
            let mut stats = self.inner.stats.lock();
            stats.executions += 1;
            if result.error.is_some() {
                stats.errors += 1;
            }
        }
        if result.error.is_some() {
            isolate.mark_unhealthy();
        }
        self.release(isolate);
    }

    /// Eagerly create `min` isolates. Failures are logged, never fatal: the
    /// pool restores `min` on demand.
    pub async fn warmup(&self) -> anyhow::Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            anyhow::bail!(SandboxError::pool_disposed());
        }
        self.ensure_reaper();
        while self.idle_count() + self.in_use_count() < self.inner.config.min {
            let isolate = match PooledIsolate::create(
                &self.inner.manager,
                self.inner.memory_limit_bytes,
            ) {
                Ok(isolate) => Arc::new(isolate),
                Err(err) => {
                    tracing::warn!("Pool warmup could not create an isolate: {err:#}");
                    break;
                },
            };
            self.inner.stats.lock().created += 1;
            if let Some(code) = &self.inner.config.warmup_code {
                match isolate.context() {
                    Ok(context) => {
                        let result = self
                            .inner
                            .execution
                            .execute(
                                code,
                                isolate.isolate(),
                                &context,
                                ExecuteOptions::default(),
                            )
                            .await;
                        if let Some(error) = result.error {
                            tracing::warn!(
                                "Warmup code failed in isolate {}: {}",
                                isolate.id(),
                                error.message
                            );
                        }
                    },
                    Err(err) => {
                        tracing::warn!("Warmup context unavailable: {err}");
                    },
                }
            }
            if isolate.is_healthy() {
                self.inner.available.lock().push_back(isolate);
            } else {
                self.retire(&isolate);
            }
        }
        Ok(())
    }

    /// Wait until no isolate is in use.
    pub async fn drain(&self) {
        loop {
            let released = self.inner.released.notified();
            if self.inner.in_use.lock().is_empty() {
                return;
            }
            released.await;
        }
    }

    /// Idempotent teardown: stops the reaper, disposes both sets, clears the
    /// queue. Future acquires fail with `PoolDisposed`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.reaper.lock().take() {
            handle.abort();
        }
        self.inner.queue.clear();
        let in_use: Vec<InUseEntry<E>> = {
            let mut in_use = self.inner.in_use.lock();
            in_use.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &in_use {
            entry.isolate.dispose();
            self.inner.stats.lock().disposed += 1;
        }
        drop(in_use);
        let available: Vec<Arc<PooledIsolate<E>>> = {
            let mut available = self.inner.available.lock();
            available.drain(..).collect()
        };
        for isolate in available {
            isolate.dispose();
            self.inner.stats.lock().disposed += 1;
        }
        self.inner.manager.dispose_all();
        self.inner.released.notify_waiters();
    }

    fn ensure_reaper(&self) {
        let mut reaper = self.inner.reaper.lock();
        if reaper.is_some() || self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let weak: Weak<PoolInner<E>> = Arc::downgrade(&self.inner);
        let tick = (self.inner.config.idle_timeout / 2).max(Duration::from_millis(1));
        *reaper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.disposed.load(Ordering::SeqCst) {
                    break;
                }
                let victims: Vec<Arc<PooledIsolate<E>>> = {
                    let mut available = inner.available.lock();
                    let mut victims = Vec::new();
                    let mut index = 0;
                    while index < available.len() {
                        let evictable = available.len() > inner.config.min
                            && available[index].idle_time() > inner.config.idle_timeout;
                        if evictable {
                            if let Some(isolate) = available.remove(index) {
                                victims.push(isolate);
                            }
                        } else {
                            index += 1;
                        }
                    }
                    victims
                };
                for isolate in victims {
                    tracing::debug!(
                        "Reaping isolate {} after {}ms idle",
                        isolate.id(),
                        isolate.idle_time().as_millis()
                    );
                    isolate.dispose();
                    inner.manager.dispose(isolate.id());
                    let mut stats = inner.stats.lock();
                    stats.reaped += 1;
                    stats.disposed += 1;
                }
            }
        }));
    }

    pub fn idle_count(&self) -> usize {
        self.inner.available.lock().len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.in_use.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        *self.inner.stats.lock()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}
