//! Wall-clock and CPU watchdogs.
//!
//! Cancellation is non-graceful: a fired watchdog disposes the isolate and
//! lets the in-flight compile/run reject as a side effect. The fired reason
//! is recorded so the execution engine can attribute that rejection.

use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use errors::{
    ErrorCode,
    SandboxError,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    events::{
        EngineEvent,
        EventHub,
        ResourceWarningKind,
    },
    guest::GuestIsolate,
    knobs::{
        INFINITE_LOOP_MIN_DETECTION_MS,
        INFINITE_LOOP_THRESHOLD,
        WATCHDOG_TICK_MS,
    },
    monitor::ResourceUsage,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KillReason {
    Timeout,
    InfiniteLoop,
    CpuLimit,
}

impl KillReason {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Timeout => ErrorCode::Timeout,
            Self::InfiniteLoop => ErrorCode::InfiniteLoop,
            Self::CpuLimit => ErrorCode::CpuLimit,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
enum WatchdogKind {
    Wall,
    Cpu,
}

#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    /// CPU-vs-wall ratio treated as a hung guest. Must be in `[0, 1]`.
    pub infinite_loop_threshold: f64,
    /// Grace window before the infinite-loop heuristic applies.
    pub min_detection: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            infinite_loop_threshold: *INFINITE_LOOP_THRESHOLD,
            min_detection: Duration::from_millis(*INFINITE_LOOP_MIN_DETECTION_MS),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if !(0.0..=1.0).contains(&self.infinite_loop_threshold) {
            return Err(SandboxError::invalid_config(format!(
                "infinite_loop_threshold must be within [0, 1], got {}",
                self.infinite_loop_threshold
            )));
        }
        Ok(())
    }
}

struct ArmedWatchdog {
    triggered: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// Registry of armed watchdogs, at most one per (execution, kind).
pub struct TimeoutManager {
    config: TimeoutConfig,
    events: EventHub,
    active: Arc<Mutex<HashMap<(String, WatchdogKind), ArmedWatchdog>>>,
    fired: Arc<Mutex<HashMap<String, KillReason>>>,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig, events: EventHub) -> Result<Self, SandboxError> {
        config.validate()?;
        Ok(Self {
            config,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
            fired: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Arm the wall-clock deadline plus infinite-loop detection.
    pub fn start_timeout<I: GuestIsolate>(
        &self,
        isolate: Arc<I>,
        timeout: Duration,
        execution_id: &str,
    ) {
        let triggered = Arc::new(AtomicBool::new(false));
        let id = execution_id.to_string();
        let events = self.events.clone();
        let active = self.active.clone();
        let fired = self.fired.clone();
        let threshold = self.config.infinite_loop_threshold;
        let min_detection = self.config.min_detection;
        let task_triggered = triggered.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let cpu_baseline = isolate.cpu_time();
            let mut warned = false;
            let mut interval =
                tokio::time::interval(Duration::from_millis(*WATCHDOG_TICK_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let elapsed = started.elapsed();
                let cpu = isolate.cpu_time().saturating_sub(cpu_baseline);
                if elapsed >= timeout {
                    tracing::warn!(
                        "Execution {id} exceeded {}ms wall clock, disposing isolate",
                        timeout.as_millis()
                    );
                    kill(
                        &task_triggered,
                        &active,
                        &fired,
                        &events,
                        &id,
                        WatchdogKind::Wall,
                        KillReason::Timeout,
                        &*isolate,
                    );
                    return;
                }
                let ratio = if elapsed.is_zero() {
                    0.0
                } else {
                    cpu.as_secs_f64() / elapsed.as_secs_f64()
                };
                if elapsed >= min_detection && ratio >= threshold {
                    tracing::warn!(
                        "Execution {id} looks like an infinite loop \
                         (cpu/wall {ratio:.2} after {}ms), disposing isolate",
                        elapsed.as_millis()
                    );
                    kill(
                        &task_triggered,
                        &active,
                        &fired,
                        &events,
                        &id,
                        WatchdogKind::Wall,
                        KillReason::InfiniteLoop,
                        &*isolate,
                    );
                    return;
                }
                if !warned && elapsed.as_secs_f64() >= 0.8 * timeout.as_secs_f64() {
                    warned = true;
                    events.emit(&EngineEvent::ResourceWarning {
                        execution_id: id.clone(),
                        kind: ResourceWarningKind::WallClock80,
                        usage: ResourceUsage {
                            cpu,
                            wall: elapsed,
                            ..ResourceUsage::default()
                        },
                    });
                }
            }
        });

        self.register(execution_id, WatchdogKind::Wall, triggered, task);
    }

    /// Arm a CPU-time cap.
    pub fn start_cpu_monitoring<I: GuestIsolate>(
        &self,
        isolate: Arc<I>,
        cpu_limit: Duration,
        execution_id: &str,
    ) {
        let triggered = Arc::new(AtomicBool::new(false));
        let id = execution_id.to_string();
        let events = self.events.clone();
        let active = self.active.clone();
        let fired = self.fired.clone();
        let task_triggered = triggered.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let cpu_baseline = isolate.cpu_time();
            let mut warned = false;
            let mut interval =
                tokio::time::interval(Duration::from_millis(*WATCHDOG_TICK_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let cpu = isolate.cpu_time().saturating_sub(cpu_baseline);
                if cpu >= cpu_limit {
                    tracing::warn!(
                        "Execution {id} exceeded {}ms of guest CPU, disposing isolate",
                        cpu_limit.as_millis()
                    );
                    kill(
                        &task_triggered,
                        &active,
                        &fired,
                        &events,
                        &id,
                        WatchdogKind::Cpu,
                        KillReason::CpuLimit,
                        &*isolate,
                    );
                    return;
                }
                if !warned && cpu.as_secs_f64() >= 0.8 * cpu_limit.as_secs_f64() {
                    warned = true;
                    events.emit(&EngineEvent::ResourceWarning {
                        execution_id: id.clone(),
                        kind: ResourceWarningKind::Cpu80,
                        usage: ResourceUsage {
                            cpu,
                            wall: started.elapsed(),
                            ..ResourceUsage::default()
                        },
                    });
                }
            }
        });

        self.register(execution_id, WatchdogKind::Cpu, triggered, task);
    }

    fn register(
        &self,
        execution_id: &str,
        kind: WatchdogKind,
        triggered: Arc<AtomicBool>,
        task: tokio::task::JoinHandle<()>,
    ) {
        let previous = self.active.lock().insert(
            (execution_id.to_string(), kind),
            ArmedWatchdog { triggered, task },
        );
        if let Some(previous) = previous {
            // Re-arming the same (execution, kind) replaces the old watchdog.
            previous.task.abort();
        }
    }

    /// Disarm both watchdogs for an execution. Idempotent; a watchdog that
    /// already fired has deregistered itself.
    pub fn clear(&self, execution_id: &str) {
        let mut active = self.active.lock();
        for kind in [WatchdogKind::Wall, WatchdogKind::Cpu] {
            if let Some(armed) = active.remove(&(execution_id.to_string(), kind)) {
                if !armed.triggered.load(Ordering::SeqCst) {
                    armed.task.abort();
                }
            }
        }
    }

    /// Consume the fired reason for an execution, if a watchdog killed it.
    pub fn take_fired(&self, execution_id: &str) -> Option<KillReason> {
        self.fired.lock().remove(execution_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Shared kill path: mark triggered, deregister (which cancels the periodic
/// tick), dispose the isolate, then announce the timeout.
#[allow(clippy::too_many_arguments)]
fn kill<I: GuestIsolate>(
    triggered: &AtomicBool,
    active: &Mutex<HashMap<(String, WatchdogKind), ArmedWatchdog>>,
    fired: &Mutex<HashMap<String, KillReason>>,
    events: &EventHub,
    execution_id: &str,
    kind: WatchdogKind,
    reason: KillReason,
    isolate: &I,
) {
    triggered.store(true, Ordering::SeqCst);
    fired
        .lock()
        .entry(execution_id.to_string())
        .or_insert(reason);
    active.lock().remove(&(execution_id.to_string(), kind));
    // Disposing twice is the engine's problem to tolerate, not ours.
    isolate.dispose();
    events.emit(&EngineEvent::Timeout {
        execution_id: execution_id.to_string(),
        reason,
        timestamp: SystemTime::now(),
    });
}
