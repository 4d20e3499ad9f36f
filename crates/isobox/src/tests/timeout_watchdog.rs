use std::{
    sync::Arc,
    time::Duration,
};

use errors::ErrorCode;
use tokio::time::Instant;

use crate::{
    events::{
        EngineEvent,
        ResourceWarningKind,
    },
    guest::{
        CompileOptions,
        GuestIsolate,
        RunOptions,
    },
    monitor::ResourceMonitor,
    tests::{
        new_isolate,
        recording_hub,
    },
    timeout::{
        KillReason,
        TimeoutConfig,
        TimeoutManager,
    },
};

async fn run_source(isolate: &Arc<crate::test_helpers::FakeIsolate>, source: &str) -> anyhow::Result<serde_json::Value> {
    let context = isolate.create_context()?;
    let script = isolate.compile(source, CompileOptions::default()).await?;
    isolate.run(&script, &context, RunOptions::default()).await
}

#[test]
fn test_threshold_validation() {
    let config = TimeoutConfig {
        infinite_loop_threshold: 1.5,
        ..TimeoutConfig::default()
    };
    let err = config.validate().unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidConfig);
    assert!(TimeoutConfig::default().validate().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_timeout_kills_isolate() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let manager = TimeoutManager::new(TimeoutConfig::default(), hub)?;
    let isolate = new_isolate();

    let started = Instant::now();
    manager.start_timeout(isolate.clone(), Duration::from_millis(200), "exec-1");
    let err = run_source(&isolate, "sleep:10000").await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(isolate.is_disposed());
    assert!(err.to_string().contains("disposed"));
    assert_eq!(manager.take_fired("exec-1"), Some(KillReason::Timeout));
    // Strictness: killed within the deadline plus watchdog jitter.
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(400), "{elapsed:?}");

    let log = log.lock();
    assert!(log.iter().any(|event| matches!(
        event,
        EngineEvent::Timeout { execution_id, reason: KillReason::Timeout, .. }
            if execution_id == "exec-1"
    )));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_busy_loop_detected_fast() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let manager = TimeoutManager::new(TimeoutConfig::default(), hub)?;
    let isolate = new_isolate();

    let started = Instant::now();
    // Ten-second budget; detection must not wait for it.
    manager.start_timeout(isolate.clone(), Duration::from_secs(10), "exec-2");
    run_source(&isolate, "spin:10000").await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(manager.take_fired("exec-2"), Some(KillReason::InfiniteLoop));
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cpu_limit_kill() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let manager = TimeoutManager::new(TimeoutConfig::default(), hub)?;
    let isolate = new_isolate();

    // 60% duty stays under the infinite-loop ratio but burns through the cap.
    manager.start_cpu_monitoring(isolate.clone(), Duration::from_millis(50), "exec-3");
    run_source(&isolate, "work:1000:60").await.unwrap_err();

    assert_eq!(manager.take_fired("exec-3"), Some(KillReason::CpuLimit));
    assert!(isolate.is_disposed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_warning_without_kill() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let manager = TimeoutManager::new(TimeoutConfig::default(), hub)?;
    let isolate = new_isolate();

    manager.start_timeout(isolate.clone(), Duration::from_millis(1000), "exec-4");
    run_source(&isolate, "sleep:900").await?;
    manager.clear("exec-4");

    assert_eq!(manager.take_fired("exec-4"), None);
    assert!(!isolate.is_disposed());
    let log = log.lock();
    assert!(
        log.iter().any(|event| matches!(
            event,
            EngineEvent::ResourceWarning { kind: ResourceWarningKind::WallClock80, .. }
        )),
        "expected an 80% wall-clock warning"
    );
    assert!(!log
        .iter()
        .any(|event| matches!(event, EngineEvent::Timeout { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_clear_disarms() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let manager = TimeoutManager::new(TimeoutConfig::default(), hub)?;
    let isolate = new_isolate();

    manager.start_timeout(isolate.clone(), Duration::from_millis(100), "exec-5");
    assert_eq!(manager.active_count(), 1);
    manager.clear("exec-5");
    manager.clear("exec-5");
    assert_eq!(manager.active_count(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!isolate.is_disposed());
    assert!(log.lock().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_monitor_aggregates_and_warns() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let monitor = ResourceMonitor::new(hub);
    let isolate = new_isolate();

    monitor.start_monitoring(
        isolate.clone(),
        "exec-6",
        Some(Duration::from_millis(100)),
        Some(crate::tests::TEST_HEAP_LIMIT),
    );
    run_source(&isolate, "work:250:50").await?;
    let stats = monitor.stop_monitoring("exec-6").expect("was armed");

    // ~125ms of CPU over ~250ms of wall.
    assert!(stats.peak_cpu >= Duration::from_millis(100), "{stats:?}");
    assert!(stats.duration >= Duration::from_millis(240), "{stats:?}");
    assert!(stats.average_cpu_percent > 30.0 && stats.average_cpu_percent < 70.0);
    let usage = stats.final_usage.expect("sampled at least once");
    assert_eq!(usage.heap_limit, crate::tests::TEST_HEAP_LIMIT);

    // CPU crossed 80% and then 95% of its limit; warnings are not deduplicated.
    let log = log.lock();
    let warn_80 = log
        .iter()
        .filter(|event| {
            matches!(
                event,
                EngineEvent::ResourceWarning { kind: ResourceWarningKind::Cpu80, .. }
            )
        })
        .count();
    let warn_95 = log
        .iter()
        .filter(|event| {
            matches!(
                event,
                EngineEvent::ResourceWarning { kind: ResourceWarningKind::Cpu95, .. }
            )
        })
        .count();
    assert!(warn_80 >= 1, "expected at least one 80% cpu warning");
    assert!(warn_95 >= 2, "95% warnings repeat every tick: {warn_95}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_monitor_memory_warnings() -> anyhow::Result<()> {
    let (hub, log) = recording_hub();
    let monitor = ResourceMonitor::new(hub);
    let isolate = new_isolate();

    let almost_all = crate::tests::TEST_HEAP_LIMIT * 85 / 100;
    monitor.start_monitoring(isolate.clone(), "exec-7", None, Some(crate::tests::TEST_HEAP_LIMIT));
    run_source(&isolate, &format!("grow-heap:{almost_all};sleep:50")).await?;
    monitor.stop_monitoring("exec-7");

    assert!(log.lock().iter().any(|event| matches!(
        event,
        EngineEvent::ResourceWarning { kind: ResourceWarningKind::Memory80, .. }
    )));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_monitor_survives_disposed_isolate() -> anyhow::Result<()> {
    let (hub, _log) = recording_hub();
    let monitor = ResourceMonitor::new(hub);
    let isolate = new_isolate();

    monitor.start_monitoring(isolate.clone(), "exec-8", None, None);
    tokio::time::sleep(Duration::from_millis(30)).await;
    isolate.dispose();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let stats = monitor.stop_monitoring("exec-8").expect("was armed");
    assert!(stats.duration >= Duration::from_millis(60));
    assert!(monitor.stop_monitoring("exec-8").is_none());
    assert!(monitor.stop_monitoring("never-armed").is_none());
    Ok(())
}
