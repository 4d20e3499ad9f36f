use std::{
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    events::{
        EngineEvent,
        EventHub,
    },
    pool::PoolConfig,
    sandbox::{
        IsoBox,
        SandboxOptions,
    },
    test_helpers::{
        FakeEngine,
        FakeIsolate,
    },
};

mod engine_exec;
mod pool;
mod sandbox_api;
mod timeout_watchdog;

pub(crate) const TEST_HEAP_LIMIT: u64 = 16 * 1024 * 1024;

pub(crate) fn test_options() -> SandboxOptions {
    SandboxOptions {
        timeout: Duration::from_secs(1),
        memory_limit: TEST_HEAP_LIMIT,
        pool: PoolConfig {
            min: 1,
            max: 2,
            idle_timeout: Duration::from_millis(500),
            warmup_code: None,
        },
        ..SandboxOptions::default()
    }
}

/// Best-effort tracing setup; fine if another test got there first.
pub(crate) fn config_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub(crate) fn new_sandbox() -> (Arc<FakeEngine>, IsoBox<FakeEngine>) {
    config_test_logging();
    let engine = FakeEngine::new();
    let sandbox = IsoBox::new(engine.clone(), test_options()).expect("valid test options");
    (engine, sandbox)
}

pub(crate) fn new_isolate() -> Arc<FakeIsolate> {
    Arc::new(FakeIsolate::new(TEST_HEAP_LIMIT))
}

/// Event hub plus a captured, ordered log of everything it emits.
pub(crate) fn recording_hub() -> (EventHub, Arc<Mutex<Vec<EngineEvent>>>) {
    let hub = EventHub::new();
    let log: Arc<Mutex<Vec<EngineEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    hub.on(move |event| sink.lock().push(event.clone()));
    (hub, log)
}
