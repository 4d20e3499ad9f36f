use std::time::Duration;

use errors::ErrorCode;
use serde_json::json;

use crate::{
    engine::{
        CompiledScript,
        ExecuteOptions,
        ExecutionDefaults,
        ExecutionEngine,
    },
    events::EngineEvent,
    guest::GuestIsolate,
    tests::{
        new_isolate,
        recording_hub,
        TEST_HEAP_LIMIT,
    },
    timeout::TimeoutConfig,
};

fn test_engine(events: crate::events::EventHub) -> ExecutionEngine {
    ExecutionEngine::new(
        ExecutionDefaults {
            timeout: Duration::from_secs(1),
            cpu_limit: Duration::from_secs(1),
            memory_limit: TEST_HEAP_LIMIT,
        },
        TimeoutConfig::default(),
        events,
    )
    .expect("valid defaults")
}

#[tokio::test(start_paused = true)]
async fn test_fast_path() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();
    let context = isolate.create_context()?;

    let result = engine
        .execute("1 + 1", &isolate, &context, ExecuteOptions::default())
        .await;

    assert_eq!(result.value, Some(json!(2)));
    assert_eq!(result.error, None);
    assert!(result.duration < Duration::from_secs(1));
    assert!(result.resource_stats.is_some());

    let log = log.lock();
    assert!(matches!(log.first(), Some(EngineEvent::ExecutionStart { .. })));
    assert!(matches!(log.last(), Some(EngineEvent::ExecutionComplete { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_guest_error_returned_as_data() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();
    let context = isolate.create_context()?;

    let result = engine
        .execute("throw:boom", &isolate, &context, ExecuteOptions::default())
        .await;

    let error = result.error.expect("guest threw");
    assert_eq!(error.code, ErrorCode::GuestRuntimeError);
    assert!(error.message.contains("boom"));
    let stack = error.stack.expect("runtime errors carry stacks");
    assert!(!stack.contains("/srv/"), "host paths must be scrubbed: {stack}");
    assert!(stack.contains("[sandbox:42:13]"), "{stack}");
    assert_eq!(result.value, None);

    let log = log.lock();
    assert!(matches!(log.last(), Some(EngineEvent::ExecutionError { .. })));
    assert!(!log
        .iter()
        .any(|event| matches!(event, EngineEvent::Timeout { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_compile_error_code() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();
    let context = isolate.create_context()?;

    let result = engine
        .execute(
            "compile-error:unexpected token",
            &isolate,
            &context,
            ExecuteOptions::default(),
        )
        .await;
    let error = result.error.expect("compilation failed");
    assert_eq!(error.code, ErrorCode::GuestCompileError);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_oom_maps_to_memory_limit() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();
    let context = isolate.create_context()?;

    let over_limit = TEST_HEAP_LIMIT + 1;
    let result = engine
        .execute(
            &format!("grow-heap:{over_limit}"),
            &isolate,
            &context,
            ExecuteOptions::default(),
        )
        .await;
    let error = result.error.expect("allocation failed");
    assert_eq!(error.code, ErrorCode::MemoryLimit);
    assert!(isolate.is_disposed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_kill_attributed_over_guest_rejection() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();
    let context = isolate.create_context()?;

    let result = engine
        .execute(
            "spin:100000",
            &isolate,
            &context,
            ExecuteOptions {
                timeout: Some(Duration::from_millis(500)),
                ..ExecuteOptions::default()
            },
        )
        .await;

    let error = result.error.expect("watchdog killed the run");
    assert_eq!(error.code, ErrorCode::InfiniteLoop);
    // Accounting survives the kill.
    assert!(result.cpu_time >= Duration::from_millis(50));
    assert!(result.resource_stats.is_some());

    // The timeout event precedes the execution error for the same id.
    let log = log.lock();
    let timeout_at = log
        .iter()
        .position(|event| matches!(event, EngineEvent::Timeout { .. }))
        .expect("timeout event emitted");
    let error_at = log
        .iter()
        .position(|event| matches!(event, EngineEvent::ExecutionError { .. }))
        .expect("error event emitted");
    assert!(timeout_at < error_at);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_execute_script_reuses_compiled_handle() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();
    let context = isolate.create_context()?;

    let compiled: CompiledScript<crate::test_helpers::FakeIsolate> =
        CompiledScript::new("value:41".to_string(), Some("app.js".to_string()));

    let first = engine
        .execute_script(&compiled, "iso-a", &isolate, &context, ExecuteOptions::default())
        .await;
    assert_eq!(first.value, Some(json!(41)));
    assert_eq!(isolate.compile_count(), 1);

    // Same isolate: the cached guest handle is reused, no recompile.
    let second = engine
        .execute_script(&compiled, "iso-a", &isolate, &context, ExecuteOptions::default())
        .await;
    assert_eq!(second.value, Some(json!(41)));
    assert_eq!(isolate.compile_count(), 1);

    // A different isolate compiles once and takes over the cache slot.
    let other = new_isolate();
    let other_context = other.create_context()?;
    let third = engine
        .execute_script(&compiled, "iso-b", &other, &other_context, ExecuteOptions::default())
        .await;
    assert_eq!(third.value, Some(json!(41)));
    assert_eq!(other.compile_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_setup_execution_context() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let engine = test_engine(hub);
    let isolate = new_isolate();

    let context = engine.setup_execution_context(&isolate)?;
    assert!(isolate.live_context_count() >= 1);
    drop(context);

    isolate.dispose();
    let err = engine.setup_execution_context(&isolate).unwrap_err();
    use errors::SandboxErrorAnyhowExt;
    assert_eq!(err.code(), Some(ErrorCode::ContextSetupFailed));
    Ok(())
}
