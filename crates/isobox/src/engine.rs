//! End-to-end orchestration of one execution.
//!
//! `execute` never fails: guest-origin errors come back as data inside the
//! [`ExecutionResult`], so callers always observe timing and resource stats —
//! including for watchdog-induced kills, where the recorded fired reason wins
//! over whatever rejection the disposal produced.

use std::{
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
        UNIX_EPOCH,
    },
};

use errors::SandboxError;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use crate::{
    events::{
        EngineEvent,
        EventHub,
        ListenerId,
    },
    guest::{
        CompileOptions,
        GuestIsolate,
        RunOptions,
    },
    monitor::{
        ResourceMonitor,
        ResourceStats,
    },
    sanitizer::{
        ErrorSanitizer,
        SanitizedError,
    },
    timeout::{
        KillReason,
        TimeoutConfig,
        TimeoutManager,
    },
};

/// Sandbox-level fallbacks applied when an invocation leaves a cap unset.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionDefaults {
    pub timeout: Duration,
    pub cpu_limit: Duration,
    pub memory_limit: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub cpu_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub filename: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Immutable per-execution metadata, for reporting only.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub id: String,
    pub start_time: SystemTime,
    pub timeout: Duration,
    pub cpu_limit: Duration,
    pub memory_limit: u64,
    pub code_length: usize,
    pub user_id: Option<String>,
    pub metadata: Option<JsonValue>,
}

#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub value: Option<JsonValue>,
    pub error: Option<SanitizedError>,
    pub duration: Duration,
    pub cpu_time: Duration,
    pub resource_stats: Option<ResourceStats>,
}

impl ExecutionResult {
    /// Re-raise the recorded error, or hand back the value (`null` for
    /// executions that produced none).
    pub fn into_value(self) -> anyhow::Result<JsonValue> {
        match self.error {
            Some(error) => Err(error.to_sandbox_error().into()),
            None => Ok(self.value.unwrap_or(JsonValue::Null)),
        }
    }
}

/// A compiled script: the source of truth plus the guest handle cached for
/// the isolate that compiled it. Running on that isolate reuses the handle;
/// any other isolate recompiles from source once and caches its own.
pub struct CompiledScript<I: GuestIsolate> {
    source: String,
    filename: Option<String>,
    cached: Mutex<Option<(String, Arc<I::Script>)>>,
}

impl<I: GuestIsolate> std::fmt::Debug for CompiledScript<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("source", &self.source)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

impl<I: GuestIsolate> CompiledScript<I> {
    pub fn new(source: String, filename: Option<String>) -> Self {
        Self {
            source,
            filename,
            cached: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn cached_for(&self, isolate_id: &str) -> Option<Arc<I::Script>> {
        let cached = self.cached.lock();
        match &*cached {
            Some((id, script)) if id == isolate_id => Some(script.clone()),
            _ => None,
        }
    }

    pub fn store(&self, isolate_id: &str, script: Arc<I::Script>) {
        *self.cached.lock() = Some((isolate_id.to_string(), script));
    }
}

/// Compile → run orchestration with watchdogs, sampling, and sanitisation.
pub struct ExecutionEngine {
    defaults: ExecutionDefaults,
    events: EventHub,
    timeouts: TimeoutManager,
    monitor: ResourceMonitor,
    sanitizer: ErrorSanitizer,
    next_seq: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(
        defaults: ExecutionDefaults,
        timeout_config: TimeoutConfig,
        events: EventHub,
    ) -> Result<Self, SandboxError> {
        let timeouts = TimeoutManager::new(timeout_config, events.clone())?;
        let monitor = ResourceMonitor::new(events.clone());
        Ok(Self {
            defaults,
            events,
            timeouts,
            monitor,
            sanitizer: ErrorSanitizer::default(),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn on(&self, listener: impl Fn(&EngineEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn defaults(&self) -> ExecutionDefaults {
        self.defaults
    }

    /// Execute source code on the given isolate/context.
    pub async fn execute<I: GuestIsolate>(
        &self,
        code: &str,
        isolate: &Arc<I>,
        context: &I::Context,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let execution = self.execution_context(code.len(), &options);
        let filename = options.filename.clone();
        let compile_filename = options.filename.clone();
        self.run_guarded(
            isolate,
            context,
            execution,
            filename,
            |isolate, context, ctx| async move {
                let script = isolate
                    .compile(
                        code,
                        CompileOptions {
                            filename: compile_filename,
                            timeout: Some(ctx.timeout),
                        },
                    )
                    .await?;
                isolate
                    .run(
                        &script,
                        &context,
                        RunOptions {
                            timeout: Some(ctx.timeout),
                            promise_aware: true,
                        },
                    )
                    .await
            },
        )
        .await
    }

    /// Run a pre-compiled script, reusing the cached guest handle when the
    /// script was compiled on this isolate.
    pub async fn execute_script<I: GuestIsolate>(
        &self,
        compiled: &CompiledScript<I>,
        isolate_id: &str,
        isolate: &Arc<I>,
        context: &I::Context,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let execution = self.execution_context(compiled.source().len(), &options);
        let filename = compiled
            .filename()
            .map(String::from)
            .or_else(|| options.filename.clone());
        let event_filename = filename.clone();
        self.run_guarded(
            isolate,
            context,
            execution,
            event_filename,
            |isolate, context, ctx| async move {
                let script = match compiled.cached_for(isolate_id) {
                    Some(script) => script,
                    None => {
                        let fresh = Arc::new(
                            isolate
                                .compile(
                                    compiled.source(),
                                    CompileOptions {
                                        filename,
                                        timeout: Some(ctx.timeout),
                                    },
                                )
                                .await?,
                        );
                        compiled.store(isolate_id, fresh.clone());
                        fresh
                    },
                };
                isolate
                    .run(
                        &script,
                        &context,
                        RunOptions {
                            timeout: Some(ctx.timeout),
                            promise_aware: true,
                        },
                    )
                    .await
            },
        )
        .await
    }

    /// Synchronously create a fresh context on the isolate.
    pub fn setup_execution_context<I: GuestIsolate>(
        &self,
        isolate: &Arc<I>,
    ) -> anyhow::Result<I::Context> {
        isolate
            .create_context()
            .map_err(|e| SandboxError::context_setup_failed(format!("{e:#}")).into())
    }

    fn execution_context(&self, code_length: usize, options: &ExecuteOptions) -> ExecutionContext {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let timeout = options.timeout.unwrap_or(self.defaults.timeout);
        ExecutionContext {
            id: format!("exec-{seq}-{millis:x}"),
            start_time: SystemTime::now(),
            timeout,
            cpu_limit: options.cpu_limit.unwrap_or(self.defaults.cpu_limit),
            memory_limit: options.memory_limit.unwrap_or(self.defaults.memory_limit),
            code_length,
            user_id: options.user_id.clone(),
            metadata: options.metadata.clone(),
        }
    }

    async fn run_guarded<I, F, Fut>(
        &self,
        isolate: &Arc<I>,
        context: &I::Context,
        execution: ExecutionContext,
        filename: Option<String>,
        invoke: F,
    ) -> ExecutionResult
    where
        I: GuestIsolate,
        F: FnOnce(Arc<I>, I::Context, ExecutionContext) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<JsonValue>>,
    {
        let execution_id = execution.id.clone();
        self.events.emit(&EngineEvent::ExecutionStart {
            execution_id: execution_id.clone(),
            timeout: execution.timeout,
            filename,
            timestamp: execution.start_time,
        });

        let started = Instant::now();
        let cpu_baseline = isolate.cpu_time();

        self.timeouts
            .start_timeout(isolate.clone(), execution.timeout, &execution_id);
        self.timeouts
            .start_cpu_monitoring(isolate.clone(), execution.cpu_limit, &execution_id);
        self.monitor.start_monitoring(
            isolate.clone(),
            &execution_id,
            Some(execution.cpu_limit),
            Some(execution.memory_limit),
        );

        let cpu_limit = execution.cpu_limit;
        let timeout = execution.timeout;
        let outcome = invoke(isolate.clone(), context.clone(), execution).await;

        self.timeouts.clear(&execution_id);
        let resource_stats = self.monitor.stop_monitoring(&execution_id);
        let duration = started.elapsed();
        let cpu_time = isolate.cpu_time().saturating_sub(cpu_baseline);

        match outcome {
            Ok(value) => {
                self.events.emit(&EngineEvent::ExecutionComplete {
                    execution_id: execution_id.clone(),
                    duration,
                    cpu_time,
                });
                ExecutionResult {
                    execution_id,
                    value: Some(value),
                    error: None,
                    duration,
                    cpu_time,
                    resource_stats,
                }
            },
            Err(err) => {
                // Any rejection after a fired watchdog is attributed to the
                // watchdog, not to whatever the dying guest produced.
                let error = match self.timeouts.take_fired(&execution_id) {
                    Some(reason) => {
                        let message = match reason {
                            KillReason::Timeout => {
                                SandboxError::timeout(duration.as_millis(), timeout.as_millis())
                                    .message
                            },
                            KillReason::InfiniteLoop => {
                                let ratio = if duration.is_zero() {
                                    0.0
                                } else {
                                    cpu_time.as_secs_f64() / duration.as_secs_f64()
                                };
                                SandboxError::infinite_loop(ratio).message
                            },
                            KillReason::CpuLimit => SandboxError::cpu_limit(
                                cpu_time.as_millis(),
                                cpu_limit.as_millis(),
                            )
                            .message,
                        };
                        SanitizedError {
                            code: reason.error_code(),
                            message,
                            stack: None,
                        }
                    },
                    None => self.sanitizer.sanitize_anyhow(&err),
                };
                self.events.emit(&EngineEvent::ExecutionError {
                    execution_id: execution_id.clone(),
                    error: error.clone(),
                });
                ExecutionResult {
                    execution_id,
                    value: None,
                    error: Some(error),
                    duration,
                    cpu_time,
                    resource_stats,
                }
            },
        }
    }
}
