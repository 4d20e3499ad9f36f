//! A scripted guest engine for exercising the sandbox without a real VM.
//!
//! `FakeIsolate` interprets a tiny `;`-separated command language:
//!
//! - `value:<json>` — produce a literal value
//! - `<a> + <b>` — integer addition
//! - `work:<ms>:<duty>` — consume `ms` of wall clock at `duty`% CPU
//! - `spin:<ms>` — `work` at 100% duty (a busy loop)
//! - `sleep:<ms>` — `work` at 0% duty
//! - `grow-heap:<bytes>` — allocate guest heap, OOMing past the limit
//! - `throw:<msg>` — fail with a runtime error carrying a host-path stack
//! - `compile-error:<msg>` — fail at compile time
//!
//! Module bodies additionally understand `set:<key>=<json>`,
//! `require:<spec>`, and `copy:<spec>:<key>`.
//!
//! Guest time is driven by tokio's clock, so paused-time tests get
//! deterministic watchdog behavior; `dispose` interrupts an in-flight run
//! through a `Notify`, mirroring a real engine's termination.

use std::{
    collections::HashSet,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{
    json,
    Value as JsonValue,
};
use tokio::sync::Notify;

use crate::guest::{
    CompileOptions,
    GuestEngine,
    GuestError,
    GuestErrorKind,
    GuestIsolate,
    HeapStatistics,
    IsolateCreateOptions,
    ModuleInvocation,
    RunOptions,
};

pub struct FakeEngine {
    created: AtomicU64,
    failing_creates: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicU64::new(0),
            failing_creates: AtomicU64::new(0),
        })
    }

    /// Make the next `n` isolate creations fail.
    pub fn fail_next_creates(&self, n: u64) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

impl GuestEngine for FakeEngine {
    type Isolate = FakeIsolate;

    fn create_isolate(&self, options: &IsolateCreateOptions) -> anyhow::Result<FakeIsolate> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("Injected isolate creation failure");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeIsolate::new(options.memory_limit_mb * 1024 * 1024))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeContext {
    pub id: u64,
}

pub struct FakeScript {
    source: String,
}

pub struct FakeIsolate {
    disposed: AtomicBool,
    disposed_notify: Notify,
    cpu: Mutex<Duration>,
    heap_used: AtomicU64,
    heap_limit: u64,
    next_context: AtomicU64,
    live_contexts: Mutex<HashSet<u64>>,
    contexts_created: AtomicU64,
    compiles: AtomicU64,
}

impl FakeIsolate {
    pub fn new(heap_limit: u64) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            disposed_notify: Notify::new(),
            cpu: Mutex::new(Duration::ZERO),
            heap_used: AtomicU64::new(0),
            heap_limit,
            next_context: AtomicU64::new(0),
            live_contexts: Mutex::new(HashSet::new()),
            contexts_created: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn live_context_count(&self) -> usize {
        self.live_contexts.lock().len()
    }

    fn terminated() -> GuestError {
        GuestError::new(GuestErrorKind::Terminated, "Isolate was disposed")
    }

    /// Advance `wall` of simulated time at `duty`% CPU, aborting promptly if
    /// the isolate is disposed mid-flight.
    async fn burn(&self, wall: Duration, duty: u64) -> Result<(), GuestError> {
        let step = Duration::from_millis(5);
        let mut remaining = wall;
        while !remaining.is_zero() {
            if self.is_disposed() {
                return Err(Self::terminated());
            }
            let chunk = remaining.min(step);
            tokio::select! {
                biased;
                _ = self.disposed_notify.notified() => {
                    return Err(Self::terminated());
                },
                _ = tokio::time::sleep(chunk) => {
                    *self.cpu.lock() += chunk.mul_f64(duty as f64 / 100.0);
                },
            }
            remaining = remaining.saturating_sub(chunk);
        }
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<Option<JsonValue>, GuestError> {
        let command = command.trim();
        if command.is_empty() {
            return Ok(None);
        }
        if let Some(literal) = command.strip_prefix("value:") {
            let value = serde_json::from_str(literal).map_err(|e| {
                GuestError::new(GuestErrorKind::Runtime, format!("Invalid literal: {e}"))
            })?;
            return Ok(Some(value));
        }
        if let Some(rest) = command.strip_prefix("work:") {
            let (wall, duty) = parse_work(rest)?;
            self.burn(wall, duty).await?;
            return Ok(None);
        }
        if let Some(ms) = command.strip_prefix("spin:") {
            self.burn(parse_millis(ms)?, 100).await?;
            return Ok(None);
        }
        if let Some(ms) = command.strip_prefix("sleep:") {
            self.burn(parse_millis(ms)?, 0).await?;
            return Ok(None);
        }
        if let Some(bytes) = command.strip_prefix("grow-heap:") {
            let bytes: u64 = bytes.trim().parse().map_err(|_| {
                GuestError::new(GuestErrorKind::Runtime, "Invalid heap size")
            })?;
            let used = self.heap_used.fetch_add(bytes, Ordering::SeqCst) + bytes;
            if used > self.heap_limit {
                self.dispose();
                return Err(GuestError::new(
                    GuestErrorKind::OutOfMemory,
                    "Guest heap limit exceeded",
                ));
            }
            return Ok(None);
        }
        if let Some(message) = command.strip_prefix("throw:") {
            return Err(GuestError::new(GuestErrorKind::Runtime, message).with_stack(
                format!(
                    "Error: {message}\n    at run (/srv/worker/src/exec.js:42:13)\n    at main \
                     (/srv/worker/src/index.js:7:1)"
                ),
            ));
        }
        if let Some((a, b)) = command.split_once('+') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
                return Ok(Some(json!(a + b)));
            }
        }
        Err(GuestError::new(
            GuestErrorKind::Runtime,
            format!("Unrecognized program: {command}"),
        ))
    }
}

#[async_trait]
impl GuestIsolate for FakeIsolate {
    type Context = FakeContext;
    type Script = FakeScript;

    async fn compile(
        &self,
        source: &str,
        _options: CompileOptions,
    ) -> anyhow::Result<FakeScript> {
        if self.is_disposed() {
            return Err(Self::terminated().into());
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = source.trim().strip_prefix("compile-error:") {
            return Err(GuestError::new(GuestErrorKind::Compile, message)
                .with_stack(format!(
                    "SyntaxError: {message}\n    at compile (/srv/worker/src/compile.js:9:3)"
                ))
                .into());
        }
        Ok(FakeScript {
            source: source.to_string(),
        })
    }

    async fn run(
        &self,
        script: &FakeScript,
        context: &FakeContext,
        _options: RunOptions,
    ) -> anyhow::Result<JsonValue> {
        if self.is_disposed() {
            return Err(Self::terminated().into());
        }
        if !self.live_contexts.lock().contains(&context.id) {
            return Err(GuestError::new(
                GuestErrorKind::Runtime,
                "Context was released",
            )
            .into());
        }
        let mut last = JsonValue::Null;
        for command in script.source.split(';') {
            if let Some(value) = self.run_command(command).await? {
                last = value;
            }
        }
        Ok(last)
    }

    async fn evaluate_module(
        &self,
        _context: &FakeContext,
        invocation: ModuleInvocation,
    ) -> anyhow::Result<()> {
        if self.is_disposed() {
            return Err(Self::terminated().into());
        }
        let source = invocation.source.clone();
        for command in source.split(';') {
            let command = command.trim();
            if command.is_empty() {
                continue;
            }
            if let Some(assignment) = command.strip_prefix("set:") {
                let (key, value) = assignment.split_once('=').ok_or_else(|| {
                    GuestError::new(GuestErrorKind::Runtime, "Malformed set command")
                })?;
                let value: JsonValue = serde_json::from_str(value.trim()).map_err(|e| {
                    GuestError::new(GuestErrorKind::Runtime, format!("Invalid literal: {e}"))
                })?;
                set_export(&invocation.exports, key.trim(), value);
                continue;
            }
            if let Some(spec) = command.strip_prefix("require:") {
                (invocation.require)(spec.trim().to_string()).await?;
                continue;
            }
            if let Some(rest) = command.strip_prefix("copy:") {
                let (spec, key) = rest.rsplit_once(':').ok_or_else(|| {
                    GuestError::new(GuestErrorKind::Runtime, "Malformed copy command")
                })?;
                let required = (invocation.require)(spec.trim().to_string()).await?;
                let snapshot = required.lock().clone();
                set_export(&invocation.exports, key.trim(), snapshot);
                continue;
            }
            if let Some(message) = command.strip_prefix("throw:") {
                return Err(GuestError::new(GuestErrorKind::Runtime, message).into());
            }
            return Err(GuestError::new(
                GuestErrorKind::Runtime,
                format!("Unrecognized module command: {command}"),
            )
            .into());
        }
        Ok(())
    }

    fn create_context(&self) -> anyhow::Result<FakeContext> {
        if self.is_disposed() {
            anyhow::bail!("Cannot create a context on a disposed isolate");
        }
        let id = self.next_context.fetch_add(1, Ordering::SeqCst);
        self.live_contexts.lock().insert(id);
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeContext { id })
    }

    fn release_context(&self, context: FakeContext) {
        self.live_contexts.lock().remove(&context.id);
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.disposed_notify.notify_waiters();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn cpu_time(&self) -> Duration {
        *self.cpu.lock()
    }

    fn heap_statistics(&self) -> HeapStatistics {
        HeapStatistics {
            used_heap: self.heap_used.load(Ordering::SeqCst),
            heap_limit: self.heap_limit,
            external_memory: 0,
        }
    }
}

fn set_export(exports: &crate::guest::ModuleExports, key: &str, value: JsonValue) {
    let mut exports = exports.lock();
    if !exports.is_object() {
        *exports = json!({});
    }
    exports
        .as_object_mut()
        .expect("just ensured object")
        .insert(key.to_string(), value);
}

fn parse_millis(raw: &str) -> Result<Duration, GuestError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| GuestError::new(GuestErrorKind::Runtime, "Invalid duration"))
}

fn parse_work(raw: &str) -> Result<(Duration, u64), GuestError> {
    let (ms, duty) = raw
        .split_once(':')
        .ok_or_else(|| GuestError::new(GuestErrorKind::Runtime, "Malformed work command"))?;
    let duty: u64 = duty
        .trim()
        .parse()
        .map_err(|_| GuestError::new(GuestErrorKind::Runtime, "Invalid duty cycle"))?;
    Ok((parse_millis(ms)?, duty.min(100)))
}
