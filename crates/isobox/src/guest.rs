//! The guest-engine capability boundary.
//!
//! The sandbox core never links a guest language engine directly; everything
//! it needs from one is expressed by [`GuestEngine`] and [`GuestIsolate`].
//! An implementation may wrap an in-process VM, a separate process, or a WASM
//! runtime, as long as `cpu_time` is monotonic and `dispose` interrupts any
//! in-flight `compile`/`run`.

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

/// Options for constructing one isolate.
#[derive(Clone, Debug)]
pub struct IsolateCreateOptions {
    /// Heap cap in whole megabytes. Callers go through
    /// `IsolateManager::create`, which floors this at the engine minimum.
    pub memory_limit_mb: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    pub filename: Option<String>,
    /// Upper bound on compilation itself; engines enforce it internally.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    /// Resolve guest promises before returning the final value.
    pub promise_aware: bool,
}

/// Snapshot of guest heap accounting.
#[derive(Copy, Clone, Debug, Default)]
pub struct HeapStatistics {
    pub used_heap: u64,
    pub heap_limit: u64,
    pub external_memory: u64,
}

impl HeapStatistics {
    pub fn total(&self) -> u64 {
        self.used_heap + self.external_memory
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GuestErrorKind {
    Compile,
    Runtime,
    OutOfMemory,
    /// The isolate was disposed out from under the running code, e.g. by a
    /// watchdog.
    Terminated,
    /// The result value cannot cross the isolation boundary (cycles,
    /// functions, host references).
    NotTransferable,
}

/// A failure surfaced by the guest engine. Stacks may reference host paths;
/// they are scrubbed by the sanitiser before leaving the sandbox.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct GuestError {
    pub kind: GuestErrorKind,
    pub message: String,
    pub stack: Option<String>,
}

impl GuestError {
    pub fn new(kind: GuestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// The shared, still-mutating exports object of a module. Handing out the
/// same `Arc` during a circular load is what makes partial exports observable
/// mid-cycle.
pub type ModuleExports = Arc<Mutex<JsonValue>>;

/// Host bridge re-entering the module system from inside a module body.
pub type HostRequire =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<ModuleExports>> + Send + Sync>;

/// Everything an engine needs to evaluate one module body.
pub struct ModuleInvocation {
    /// Canonical resolved module id.
    pub id: String,
    pub source: String,
    /// The exports object to populate; already registered in the cache.
    pub exports: ModuleExports,
    pub require: HostRequire,
}

/// One guest execution environment: its own heap, CPU accounting, and
/// dispose lifecycle.
#[async_trait]
pub trait GuestIsolate: Send + Sync + 'static {
    /// A global scope inside the isolate. Cheap to clone; engines typically
    /// hand out keyed handles to internal state.
    type Context: Clone + Send + Sync + 'static;
    type Script: Send + Sync + 'static;

    async fn compile(&self, source: &str, options: CompileOptions)
        -> anyhow::Result<Self::Script>;

    /// Run a compiled script. The returned value must be detached from the
    /// guest heap; mutating it never affects guest state.
    async fn run(
        &self,
        script: &Self::Script,
        context: &Self::Context,
        options: RunOptions,
    ) -> anyhow::Result<JsonValue>;

    /// Evaluate a module body, populating `invocation.exports` and re-entering
    /// the host through `invocation.require` for nested imports.
    async fn evaluate_module(
        &self,
        context: &Self::Context,
        invocation: ModuleInvocation,
    ) -> anyhow::Result<()>;

    fn create_context(&self) -> anyhow::Result<Self::Context>;

    fn release_context(&self, context: Self::Context);

    /// Non-graceful teardown. Must interrupt in-flight `compile`/`run` and be
    /// safe to call more than once.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// Monotonic guest CPU counter, nanosecond resolution. Must remain
    /// readable after `dispose` (returning the final value).
    fn cpu_time(&self) -> Duration;

    /// Must remain readable after `dispose`.
    fn heap_statistics(&self) -> HeapStatistics;
}

/// Factory for isolates. The core is parametric over this.
pub trait GuestEngine: Send + Sync + 'static {
    type Isolate: GuestIsolate;

    fn create_isolate(&self, options: &IsolateCreateOptions) -> anyhow::Result<Self::Isolate>;
}

pub type ContextOf<E> = <<E as GuestEngine>::Isolate as GuestIsolate>::Context;
pub type ScriptOf<E> = <<E as GuestEngine>::Isolate as GuestIsolate>::Script;
