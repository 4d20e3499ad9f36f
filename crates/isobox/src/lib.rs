//! Multi-tenant code sandbox runtime.
//!
//! Accepts untrusted script source and executes it inside an isolated guest
//! environment under hard resource caps (wall clock, guest CPU, guest heap),
//! with a virtual in-memory filesystem and a controlled module loader. The
//! guest language engine is an opaque capability ([`guest::GuestEngine`]);
//! the crate supplies everything around it: isolate pooling and health
//! tracking, the compile→run execution engine, watchdogs, resource sampling,
//! error sanitisation, and the `require` machinery.

pub mod engine;
pub mod events;
pub mod guest;
pub mod knobs;
pub mod manager;
pub mod modules;
pub mod monitor;
pub mod pool;
pub mod pooled;
pub mod queue;
pub mod sandbox;
pub mod sanitizer;
pub mod session;
pub mod timeout;

#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use errors::{
    ErrorCode,
    SandboxError,
    SandboxErrorAnyhowExt,
};
pub use memfs::{
    MemFs,
    MemFsConfig,
};

pub use self::{
    engine::{
        CompiledScript,
        ExecuteOptions,
        ExecutionContext,
        ExecutionDefaults,
        ExecutionEngine,
        ExecutionResult,
    },
    events::{
        EngineEvent,
        EventHub,
        ListenerId,
        ResourceWarningKind,
    },
    manager::{
        IsolateManager,
        IsolateManagerStats,
    },
    modules::{
        CircularDeps,
        ImportResolver,
        ModuleCache,
        ModuleCacheStats,
        ModuleSource,
        ModuleSystem,
    },
    monitor::{
        ResourceMonitor,
        ResourceStats,
        ResourceUsage,
    },
    pool::{
        IsolatePool,
        PoolConfig,
        PoolStats,
    },
    pooled::PooledIsolate,
    queue::AsyncQueue,
    sandbox::{
        IsoBox,
        RunOptions,
        SandboxOptions,
    },
    sanitizer::{
        ErrorSanitizer,
        SanitizedError,
    },
    session::{
        Session,
        SessionOptions,
    },
    timeout::{
        KillReason,
        TimeoutConfig,
        TimeoutManager,
    },
};
