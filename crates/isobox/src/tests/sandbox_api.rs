use std::time::Duration;

use errors::{
    ErrorCode,
    SandboxErrorAnyhowExt,
};
use serde_json::json;

use crate::{
    events::EngineEvent,
    modules::ModuleSource,
    sandbox::{
        IsoBox,
        RunOptions,
        SandboxOptions,
    },
    session::SessionOptions,
    test_helpers::FakeEngine,
    tests::{
        new_sandbox,
        test_options,
    },
};

#[tokio::test(start_paused = true)]
async fn test_fast_path_run() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    let value = sandbox
        .run(
            "1 + 1",
            RunOptions {
                timeout: Some(Duration::from_millis(1000)),
                ..RunOptions::default()
            },
        )
        .await?;
    assert_eq!(value, json!(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_empty_code_rejected() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    let err = sandbox.run("   ", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidInput));
    assert!(err.to_string().contains("Code cannot be empty"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_busy_loop_killed_within_budget() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    let result = sandbox
        .execute(
            "spin:100000",
            RunOptions {
                timeout: Some(Duration::from_millis(200)),
                ..RunOptions::default()
            },
        )
        .await?;
    let duration = result.duration;
    let error = result.error.expect("watchdog fired");
    assert!(
        matches!(error.code, ErrorCode::InfiniteLoop | ErrorCode::Timeout),
        "{error:?}"
    );
    assert!(duration <= Duration::from_millis(300), "duration = {duration:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_heap_exhaustion_replaces_isolate() -> anyhow::Result<()> {
    let engine = FakeEngine::new();
    let sandbox = IsoBox::new(
        engine.clone(),
        SandboxOptions {
            memory_limit: 8 * 1024 * 1024,
            ..test_options()
        },
    )?;

    let result = sandbox
        .execute("grow-heap:9000000", RunOptions::default())
        .await?;
    let error = result.error.expect("over the heap limit");
    assert!(
        matches!(
            error.code,
            ErrorCode::MemoryLimit | ErrorCode::GuestRuntimeError
        ),
        "{error:?}"
    );
    assert_eq!(engine.created_count(), 1);

    // The poisoned isolate was dropped; a fresh one serves the next run.
    let value = sandbox.run("1 + 1", RunOptions::default()).await?;
    assert_eq!(value, json!(2));
    assert_eq!(engine.created_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fs_round_trip_through_sandbox() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    sandbox.fs().write("/x/y.txt", "hello")?;
    assert_eq!(sandbox.fs().read("/x/y.txt")?, b"hello".to_vec());
    assert!(sandbox.fs().stat("/x")?.is_directory);
    assert_eq!(sandbox.fs().read_dir("/x")?, vec!["y.txt".to_string()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_compile_then_run_script() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    let compiled = sandbox.compile("value:7").await?;
    let value = sandbox.run_script(&compiled, RunOptions::default()).await?;
    assert_eq!(value, json!(7));
    // Rerunning the same compiled script works and returns the same value.
    let again = sandbox.run_script(&compiled, RunOptions::default()).await?;
    assert_eq!(again, json!(7));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_compile_error_propagates() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    let err = sandbox.compile("compile-error:bad token").await.unwrap_err();
    assert!(err.to_string().contains("bad token"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sessions() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();

    let session = sandbox.create_session("tenant-1", SessionOptions::default())?;
    session.set("counter", json!(1));
    assert_eq!(
        sandbox.get_session("tenant-1").unwrap().get("counter"),
        Some(json!(1))
    );

    let dup = sandbox
        .create_session("tenant-1", SessionOptions::default())
        .unwrap_err();
    assert_eq!(dup.code, ErrorCode::InvalidInput);

    // TTL expiry: lookups after the deadline see nothing.
    sandbox.create_session(
        "ephemeral",
        SessionOptions {
            ttl: Some(Duration::from_millis(100)),
        },
    )?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sandbox.get_session("ephemeral").is_none());

    assert!(sandbox.remove_session("tenant-1"));
    assert!(!sandbox.remove_session("tenant-1"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_modules_through_sandbox() -> anyhow::Result<()> {
    let engine = FakeEngine::new();
    let sandbox = IsoBox::new(
        engine,
        SandboxOptions {
            modules: vec![ModuleSource {
                name: "config".to_string(),
                source: "set:debug=false".to_string(),
            }],
            ..test_options()
        },
    )?;

    let exports = sandbox.require("config").await?;
    assert_eq!(*exports.lock(), json!({"debug": false}));
    assert_eq!(sandbox.module_cache_stats().sets, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_event_ordering_per_execution() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    let log: std::sync::Arc<parking_lot::Mutex<Vec<EngineEvent>>> =
        std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = log.clone();
    let listener = sandbox.on(move |event| sink.lock().push(event.clone()));

    sandbox.run("1 + 1", RunOptions::default()).await?;
    {
        let log = log.lock();
        assert!(matches!(log.first(), Some(EngineEvent::ExecutionStart { .. })));
        assert!(matches!(
            log.last(),
            Some(EngineEvent::ExecutionComplete { .. })
        ));
    }

    assert!(sandbox.off(listener));
    assert!(!sandbox.off(listener));
    sandbox.run("1 + 1", RunOptions::default()).await?;
    // No further events were delivered after `off`.
    assert!(matches!(
        log.lock().last(),
        Some(EngineEvent::ExecutionComplete { .. })
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispose_semantics() -> anyhow::Result<()> {
    let (_engine, sandbox) = new_sandbox();
    sandbox.run("1 + 1", RunOptions::default()).await?;

    sandbox.dispose();
    sandbox.dispose();
    assert!(sandbox.is_disposed());

    let err = sandbox.run("1 + 1", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SandboxDisposed));
    Ok(())
}

#[test]
fn test_option_validation() {
    let engine = FakeEngine::new();

    let zero_timeout = SandboxOptions {
        timeout: Duration::ZERO,
        ..SandboxOptions::default()
    };
    let err = IsoBox::new(engine.clone(), zero_timeout).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidConfig));

    let tiny_memory = SandboxOptions {
        memory_limit: 1024,
        ..SandboxOptions::default()
    };
    let err = IsoBox::new(engine.clone(), tiny_memory).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidConfig));

    let bad_pool = SandboxOptions {
        pool: crate::pool::PoolConfig {
            min: 2,
            max: 1,
            idle_timeout: Duration::from_secs(30),
            warmup_code: None,
        },
        ..SandboxOptions::default()
    };
    let err = IsoBox::new(engine.clone(), bad_pool).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidConfig));

    let bad_threshold = SandboxOptions {
        watchdog: crate::timeout::TimeoutConfig {
            infinite_loop_threshold: 2.0,
            ..crate::timeout::TimeoutConfig::default()
        },
        ..SandboxOptions::default()
    };
    let err = IsoBox::new(engine, bad_threshold).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidConfig));
}

#[tokio::test(start_paused = true)]
async fn test_warmup_primes_pool() -> anyhow::Result<()> {
    let engine = FakeEngine::new();
    let sandbox = IsoBox::new(
        engine.clone(),
        SandboxOptions {
            pool: crate::pool::PoolConfig {
                min: 2,
                max: 3,
                idle_timeout: Duration::from_secs(30),
                warmup_code: Some("value:\"warm\"".to_string()),
            },
            ..test_options()
        },
    )?;
    sandbox.warmup().await?;
    assert_eq!(engine.created_count(), 2);
    assert_eq!(sandbox.pool().idle_count(), 2);
    Ok(())
}
