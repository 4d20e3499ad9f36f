//! The host-facing sandbox: validated options in, coded errors out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use errors::SandboxError;
use memfs::{
    MemFs,
    MemFsConfig,
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::{
    engine::{
        CompiledScript,
        ExecuteOptions,
        ExecutionDefaults,
        ExecutionEngine,
        ExecutionResult,
    },
    events::{
        EngineEvent,
        EventHub,
        ListenerId,
    },
    guest::{
        GuestEngine,
        GuestIsolate,
        ModuleExports,
    },
    knobs::MIN_ISOLATE_MEMORY_MB,
    modules::{
        ImportResolver,
        ModuleCacheStats,
        ModuleSource,
        ModuleSystem,
    },
    pool::{
        IsolatePool,
        PoolConfig,
        PoolStats,
    },
    session::{
        Session,
        SessionOptions,
    },
    timeout::TimeoutConfig,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MEMORY_LIMIT: u64 = 128 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct SandboxOptions {
    /// Default wall-clock cap per execution.
    pub timeout: Duration,
    /// Default guest heap cap in bytes.
    pub memory_limit: u64,
    /// Default guest CPU cap; falls back to `timeout`.
    pub cpu_limit: Option<Duration>,
    /// Reserved: timeouts are currently always strict.
    pub strict_timeout: bool,
    /// Allow-listed named module sources.
    pub modules: Vec<ModuleSource>,
    pub filesystem: MemFsConfig,
    pub pool: PoolConfig,
    pub watchdog: TimeoutConfig,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            cpu_limit: None,
            strict_timeout: true,
            modules: Vec::new(),
            filesystem: MemFsConfig::default(),
            pool: PoolConfig::default(),
            watchdog: TimeoutConfig::default(),
        }
    }
}

impl SandboxOptions {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.timeout.is_zero() {
            return Err(SandboxError::invalid_config("timeout must be positive"));
        }
        let min_bytes = *MIN_ISOLATE_MEMORY_MB * 1024 * 1024;
        if self.memory_limit < min_bytes {
            return Err(SandboxError::invalid_config(format!(
                "memory_limit must be at least {min_bytes} bytes ({}MB)",
                *MIN_ISOLATE_MEMORY_MB
            )));
        }
        if let Some(cpu_limit) = self.cpu_limit {
            if cpu_limit.is_zero() {
                return Err(SandboxError::invalid_config("cpu_limit must be positive"));
            }
        }
        self.pool.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }
}

/// Per-invocation overrides for `run`/`run_script`.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub cpu_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub filename: Option<String>,
}

impl RunOptions {
    fn into_execute_options(self) -> ExecuteOptions {
        ExecuteOptions {
            timeout: self.timeout,
            cpu_limit: self.cpu_limit,
            memory_limit: self.memory_limit,
            filename: self.filename,
            user_id: None,
            metadata: None,
        }
    }
}

/// One sandbox: an isolate pool, a virtual filesystem, a module system, and
/// sessions, sharing a single event surface.
pub struct IsoBox<E: GuestEngine> {
    pool: IsolatePool<E>,
    fs: Arc<MemFs>,
    modules: Arc<ModuleSystem>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    events: EventHub,
    disposed: AtomicBool,
}

impl<E: GuestEngine> std::fmt::Debug for IsoBox<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoBox")
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl<E: GuestEngine> IsoBox<E> {
    pub fn new(engine: Arc<E>, options: SandboxOptions) -> anyhow::Result<Self> {
        options.validate()?;
        let fs = Arc::new(MemFs::new(options.filesystem.clone()));

        let mut resolver = ImportResolver::new(fs.clone());
        for module in &options.modules {
            resolver.register(module.clone());
        }
        let modules = Arc::new(ModuleSystem::new(resolver));

        let events = EventHub::new();
        let defaults = ExecutionDefaults {
            timeout: options.timeout,
            cpu_limit: options.cpu_limit.unwrap_or(options.timeout),
            memory_limit: options.memory_limit,
        };
        let execution =
            ExecutionEngine::new(defaults, options.watchdog.clone(), events.clone())?;
        let pool = IsolatePool::new(
            engine,
            options.pool.clone(),
            options.memory_limit,
            execution,
        )?;

        Ok(Self {
            pool,
            fs,
            modules,
            sessions: Mutex::new(HashMap::new()),
            events,
            disposed: AtomicBool::new(false),
        })
    }

    fn check_live(&self) -> Result<(), SandboxError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SandboxError::sandbox_disposed());
        }
        Ok(())
    }

    fn check_code(code: &str) -> Result<(), SandboxError> {
        if code.trim().is_empty() {
            return Err(SandboxError::invalid_input("Code cannot be empty"));
        }
        Ok(())
    }

    /// Run code and return its value, re-raising any execution error as a
    /// coded `SandboxError`.
    pub async fn run(&self, code: &str, options: RunOptions) -> anyhow::Result<JsonValue> {
        self.execute(code, options).await?.into_value()
    }

    /// Run code, returning the full result with errors as data.
    pub async fn execute(
        &self,
        code: &str,
        options: RunOptions,
    ) -> anyhow::Result<ExecutionResult> {
        self.check_live()?;
        Self::check_code(code)?;
        self.pool.execute(code, options.into_execute_options()).await
    }

    /// Compile code on a pooled isolate, caching the guest script handle for
    /// reuse by `run_script`.
    pub async fn compile(&self, code: &str) -> anyhow::Result<CompiledScript<E::Isolate>> {
        self.check_live()?;
        Self::check_code(code)?;
        let isolate = self.pool.acquire().await?;
        let compiled = CompiledScript::new(code.to_string(), None);
        let result = async {
            let script = isolate
                .isolate()
                .compile(code, crate::guest::CompileOptions::default())
                .await?;
            compiled.store(isolate.id(), Arc::new(script));
            anyhow::Ok(())
        }
        .await;
        if result.is_err() {
            isolate.mark_unhealthy();
        }
        self.pool.release(&isolate);
        result?;
        Ok(compiled)
    }

    /// Run a previously compiled script, re-raising errors like `run`.
    pub async fn run_script(
        &self,
        compiled: &CompiledScript<E::Isolate>,
        options: RunOptions,
    ) -> anyhow::Result<JsonValue> {
        self.check_live()?;
        self.pool
            .execute_script(compiled, options.into_execute_options())
            .await?
            .into_value()
    }

    /// Load a module through the sandbox's resolver and return its exports.
    pub async fn require(&self, request: &str) -> anyhow::Result<ModuleExports> {
        self.check_live()?;
        let isolate = self.pool.acquire().await?;
        let context = match isolate.context() {
            Ok(context) => context,
            Err(err) => {
                isolate.mark_unhealthy();
                self.pool.release(&isolate);
                return Err(err.into());
            },
        };
        let result = self
            .modules
            .clone()
            .require(
                isolate.isolate().clone(),
                context,
                "/sandbox/main".to_string(),
                request.to_string(),
            )
            .await;
        self.pool.release(&isolate);
        result
    }

    /// Eagerly create the pool's minimum set of isolates.
    pub async fn warmup(&self) -> anyhow::Result<()> {
        self.check_live()?;
        self.pool.warmup().await
    }

    pub fn create_session(
        &self,
        id: &str,
        options: SessionOptions,
    ) -> Result<Arc<Session>, SandboxError> {
        self.check_live()?;
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            if !existing.is_expired() {
                return Err(SandboxError::invalid_input(format!(
                    "Session {id} already exists"
                )));
            }
            // An expired session under the same id is replaced.
            sessions.remove(id);
        }
        let session = Arc::new(Session::new(id.to_string(), options));
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    /// Expired sessions are dropped on lookup.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(session) if session.is_expired() => {
                sessions.remove(id);
                None
            },
            Some(session) => {
                session.touch();
                Some(session.clone())
            },
            None => None,
        }
    }

    pub fn remove_session(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    pub fn fs(&self) -> &Arc<MemFs> {
        &self.fs
    }

    pub fn modules(&self) -> &Arc<ModuleSystem> {
        &self.modules
    }

    pub fn register_module(&self, module: ModuleSource) {
        self.modules.register(module);
    }

    pub fn on(&self, listener: impl Fn(&EngineEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn module_cache_stats(&self) -> ModuleCacheStats {
        self.modules.cache_stats()
    }

    pub fn pool(&self) -> &IsolatePool<E> {
        &self.pool
    }

    /// Idempotent; subsequent `run` calls fail with `SandboxDisposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.dispose();
        self.sessions.lock().clear();
        self.fs.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
