//! Per-instance event surface.
//!
//! No process-global emitters: each engine/pool owns an [`EventHub`] and
//! hands clones to its watchdogs and monitors. Listener panics are isolated
//! from the emitting component.

use std::{
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use parking_lot::Mutex;

use crate::{
    monitor::ResourceUsage,
    sanitizer::SanitizedError,
    timeout::KillReason,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceWarningKind {
    /// 80% of the CPU budget consumed.
    Cpu80,
    Cpu95,
    Memory80,
    Memory95,
    /// 80% of the wall-clock timeout elapsed; always high severity.
    WallClock80,
}

#[derive(Clone, Debug)]
pub enum EngineEvent {
    ExecutionStart {
        execution_id: String,
        timeout: Duration,
        filename: Option<String>,
        timestamp: SystemTime,
    },
    ExecutionComplete {
        execution_id: String,
        duration: Duration,
        cpu_time: Duration,
    },
    ExecutionError {
        execution_id: String,
        error: SanitizedError,
    },
    Timeout {
        execution_id: String,
        reason: KillReason,
        timestamp: SystemTime,
    },
    ResourceWarning {
        execution_id: String,
        kind: ResourceWarningKind,
        usage: ResourceUsage,
    },
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Observer list shared by the execution engine, watchdogs, and monitors of
/// one sandbox. Clones share the same listeners.
#[derive(Clone)]
pub struct EventHub {
    listeners: Arc<Mutex<Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn on(&self, listener: impl Fn(&EngineEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver to every listener; a panicking listener is logged and skipped,
    /// never unwinding into the emitter.
    pub fn emit(&self, event: &EngineEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::warn!("Event listener panicked: {panic:?}");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
