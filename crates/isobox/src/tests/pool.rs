use std::{
    sync::Arc,
    time::Duration,
};

use errors::{
    ErrorCode,
    SandboxErrorAnyhowExt,
};

use crate::{
    engine::{
        ExecuteOptions,
        ExecutionDefaults,
        ExecutionEngine,
    },
    events::EventHub,
    guest::GuestIsolate,
    pool::{
        IsolatePool,
        PoolConfig,
    },
    test_helpers::FakeEngine,
    tests::TEST_HEAP_LIMIT,
    timeout::TimeoutConfig,
};

fn test_pool(min: usize, max: usize, idle_timeout: Duration) -> (Arc<FakeEngine>, IsolatePool<FakeEngine>) {
    let engine = FakeEngine::new();
    let defaults = ExecutionDefaults {
        timeout: Duration::from_secs(1),
        cpu_limit: Duration::from_secs(1),
        memory_limit: TEST_HEAP_LIMIT,
    };
    let execution = ExecutionEngine::new(defaults, TimeoutConfig::default(), EventHub::new())
        .expect("valid defaults");
    let pool = IsolatePool::new(
        engine.clone(),
        PoolConfig {
            min,
            max,
            idle_timeout,
            warmup_code: None,
        },
        TEST_HEAP_LIMIT,
        execution,
    )
    .expect("valid pool config");
    (engine, pool)
}

#[test]
fn test_config_validation() {
    assert_eq!(
        PoolConfig {
            min: 0,
            max: 2,
            idle_timeout: Duration::from_secs(30),
            warmup_code: None,
        }
        .validate()
        .unwrap_err()
        .code,
        ErrorCode::InvalidConfig
    );
    assert_eq!(
        PoolConfig {
            min: 3,
            max: 2,
            idle_timeout: Duration::from_secs(30),
            warmup_code: None,
        }
        .validate()
        .unwrap_err()
        .code,
        ErrorCode::InvalidConfig
    );
}

#[tokio::test(start_paused = true)]
async fn test_acquire_release_reuses_isolates() -> anyhow::Result<()> {
    let (engine, pool) = test_pool(1, 2, Duration::from_secs(30));

    let first = pool.acquire().await?;
    let first_id = first.id().to_string();
    assert_eq!(pool.in_use_count(), 1);
    pool.release(&first);
    assert_eq!((pool.in_use_count(), pool.idle_count()), (0, 1));

    // A healthy isolate is reused with a fresh context.
    let contexts_before = first.isolate().contexts_created();
    let second = pool.acquire().await?;
    assert_eq!(second.id(), first_id);
    assert!(second.isolate().contexts_created() > contexts_before);
    assert_eq!(second.isolate().live_context_count(), 1);
    pool.release(&second);

    assert_eq!(engine.created_count(), 1);
    assert_eq!(pool.stats().reused, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pool_size_never_exceeds_max() -> anyhow::Result<()> {
    let (_engine, pool) = test_pool(1, 2, Duration::from_secs(30));

    let a = pool.acquire().await?;
    let b = pool.acquire().await?;
    assert_eq!(pool.in_use_count() + pool.idle_count(), 2);

    // A third acquire must wait for a release.
    let pool = Arc::new(pool);
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|iso| iso.id().to_string()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished(), "acquire beyond max must queue");

    pool.release(&a);
    let reused_id = waiter.await??;
    assert_eq!(reused_id, a.id());
    assert!(pool.in_use_count() + pool.idle_count() <= 2);
    pool.release(&b);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_isolate_replaced() -> anyhow::Result<()> {
    let (engine, pool) = test_pool(1, 2, Duration::from_secs(30));

    let result = pool.execute("throw:boom", ExecuteOptions::default()).await?;
    assert_eq!(
        result.error.as_ref().map(|e| e.code),
        Some(ErrorCode::GuestRuntimeError)
    );
    // The failed isolate was disposed, not returned to the idle set.
    assert_eq!((pool.in_use_count(), pool.idle_count()), (0, 0));
    assert_eq!(pool.stats().errors, 1);

    let ok = pool.execute("1 + 1", ExecuteOptions::default()).await?;
    assert_eq!(ok.value, Some(serde_json::json!(2)));
    assert_eq!(engine.created_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_warmup_counts_and_failures() -> anyhow::Result<()> {
    let (engine, pool) = test_pool(2, 4, Duration::from_secs(30));

    pool.warmup().await?;
    assert_eq!(pool.idle_count(), 2);
    assert_eq!(engine.created_count(), 2);

    // Warmup failures are logged, never fatal.
    let (engine, pool) = test_pool(2, 4, Duration::from_secs(30));
    engine.fail_next_creates(10);
    pool.warmup().await?;
    assert_eq!(pool.idle_count(), 0);

    // Min is restored on demand.
    engine.fail_next_creates(0);
    let isolate = pool.acquire().await?;
    pool.release(&isolate);
    assert_eq!(pool.idle_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reaper_never_shrinks_below_min() -> anyhow::Result<()> {
    let (_engine, pool) = test_pool(1, 3, Duration::from_millis(200));

    let a = pool.acquire().await?;
    let b = pool.acquire().await?;
    let c = pool.acquire().await?;
    pool.release(&a);
    pool.release(&b);
    pool.release(&c);
    assert_eq!(pool.idle_count(), 3);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(pool.idle_count(), 1, "reaper keeps min isolates");
    assert_eq!(pool.stats().reaped, 2);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(pool.idle_count(), 1, "never below min");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_drain_waits_for_in_use() -> anyhow::Result<()> {
    let (_engine, pool) = test_pool(1, 2, Duration::from_secs(30));
    let pool = Arc::new(pool);

    let isolate = pool.acquire().await?;
    let releaser = {
        let pool = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            pool.release(&isolate);
        })
    };
    pool.drain().await;
    assert_eq!(pool.in_use_count(), 0);
    releaser.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispose_is_idempotent_and_rejects_acquire() -> anyhow::Result<()> {
    let (_engine, pool) = test_pool(1, 2, Duration::from_secs(30));

    let held = pool.acquire().await?;
    let held_isolate = held.isolate().clone();
    pool.dispose();
    pool.dispose();

    assert!(pool.is_disposed());
    assert!(held_isolate.is_disposed(), "in-use isolates are torn down");
    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PoolDisposed));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_queued_acquire_rejected_on_dispose() -> anyhow::Result<()> {
    let (_engine, pool) = test_pool(1, 1, Duration::from_secs(30));
    let pool = Arc::new(pool);

    let _held = pool.acquire().await?;
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.dispose();
    let err = waiter.await?.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::PoolDisposed));
    Ok(())
}
