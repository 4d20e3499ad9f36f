//! Sampled CPU/heap accounting for in-flight executions.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use humansize::{
    FormatSize,
    BINARY,
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
    knobs::MONITOR_TICK_MS,
};

const WARN_RATIO: f64 = 0.80;
const CRITICAL_RATIO: f64 = 0.95;

/// One sample of guest resource consumption.
#[derive(Clone, Debug, Default)]
pub struct ResourceUsage {
    pub cpu: Duration,
    pub wall: Duration,
    pub heap_used: u64,
    pub heap_limit: u64,
    pub external_memory: u64,
    pub total_memory: u64,
    /// `min(100, cpu/wall * 100)`.
    pub cpu_percent: f64,
    /// Total memory as a percentage of the heap limit.
    pub memory_percent: f64,
}

/// Aggregate over one monitored execution.
#[derive(Clone, Debug, Default)]
pub struct ResourceStats {
    pub peak_cpu: Duration,
    pub peak_heap: u64,
    pub peak_total: u64,
    pub final_usage: Option<ResourceUsage>,
    pub average_cpu_percent: f64,
    pub duration: Duration,
}

struct MonitorAccum {
    started: Instant,
    cpu_baseline: Duration,
    peak_cpu: Duration,
    peak_heap: u64,
    peak_total: u64,
    samples: u64,
    cpu_percent_sum: f64,
    last: Option<ResourceUsage>,
}

struct ActiveMonitor {
    accum: Arc<Mutex<MonitorAccum>>,
    task: tokio::task::JoinHandle<()>,
}

/// Periodic sampler over an isolate's `cpu_time` and heap statistics.
/// Warnings are emitted on every tick past the threshold; consumers decide
/// whether to de-duplicate.
pub struct ResourceMonitor {
    events: EventHub,
    active: Mutex<HashMap<String, ActiveMonitor>>,
}

impl ResourceMonitor {
    pub fn new(events: EventHub) -> Self {
        Self {
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Arm the sampler for one execution. Sampling errors on an already
    /// disposed isolate are swallowed per tick; `stop_monitoring` still
    /// returns the aggregate collected so far.
    pub fn start_monitoring<I: GuestIsolate>(
        &self,
        isolate: Arc<I>,
        execution_id: &str,
        cpu_limit: Option<Duration>,
        memory_limit: Option<u64>,
    ) -> String {
        let started = Instant::now();
        let accum = Arc::new(Mutex::new(MonitorAccum {
            started,
            cpu_baseline: isolate.cpu_time(),
            peak_cpu: Duration::ZERO,
            peak_heap: 0,
            peak_total: 0,
            samples: 0,
            cpu_percent_sum: 0.0,
            last: None,
        }));

        let events = self.events.clone();
        let task_accum = accum.clone();
        let id = execution_id.to_string();
        let task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(*MONITOR_TICK_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick is the zero-wall sample; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                if isolate.is_disposed() {
                    continue;
                }
                let usage = {
                    let mut accum = task_accum.lock();
                    let wall = accum.started.elapsed();
                    let cpu = isolate.cpu_time().saturating_sub(accum.cpu_baseline);
                    let heap = isolate.heap_statistics();
                    let cpu_percent = if wall.is_zero() {
                        0.0
                    } else {
                        (cpu.as_secs_f64() / wall.as_secs_f64() * 100.0).min(100.0)
                    };
                    let memory_percent = if heap.heap_limit == 0 {
                        0.0
                    } else {
                        heap.total() as f64 / heap.heap_limit as f64 * 100.0
                    };
                    let usage = ResourceUsage {
                        cpu,
                        wall,
                        heap_used: heap.used_heap,
                        heap_limit: heap.heap_limit,
                        external_memory: heap.external_memory,
                        total_memory: heap.total(),
                        cpu_percent,
                        memory_percent,
                    };
                    accum.peak_cpu = accum.peak_cpu.max(cpu);
                    accum.peak_heap = accum.peak_heap.max(heap.used_heap);
                    accum.peak_total = accum.peak_total.max(heap.total());
                    accum.samples += 1;
                    accum.cpu_percent_sum += cpu_percent;
                    accum.last = Some(usage.clone());
                    usage
                };
                if let Some(limit) = cpu_limit {
                    let limit_secs = limit.as_secs_f64();
                    if usage.cpu.as_secs_f64() >= CRITICAL_RATIO * limit_secs {
                        events.emit(&EngineEvent::ResourceWarning {
                            execution_id: id.clone(),
                            kind: ResourceWarningKind::Cpu95,
                            usage: usage.clone(),
                        });
                    } else if usage.cpu.as_secs_f64() >= WARN_RATIO * limit_secs {
                        events.emit(&EngineEvent::ResourceWarning {
                            execution_id: id.clone(),
                            kind: ResourceWarningKind::Cpu80,
                            usage: usage.clone(),
                        });
                    }
                }
                if let Some(limit) = memory_limit {
                    let total = usage.total_memory as f64;
                    if total >= CRITICAL_RATIO * limit as f64 {
                        tracing::debug!(
                            "Execution {id} at {} of {} memory",
                            usage.total_memory.format_size(BINARY),
                            limit.format_size(BINARY),
                        );
                        events.emit(&EngineEvent::ResourceWarning {
                            execution_id: id.clone(),
                            kind: ResourceWarningKind::Memory95,
                            usage: usage.clone(),
                        });
                    } else if total >= WARN_RATIO * limit as f64 {
                        events.emit(&EngineEvent::ResourceWarning {
                            execution_id: id.clone(),
                            kind: ResourceWarningKind::Memory80,
                            usage: usage.clone(),
                        });
                    }
                }
            }
        });

        self.active.lock().insert(
            execution_id.to_string(),
            ActiveMonitor { accum, task },
        );
        execution_id.to_string()
    }

    /// Cancel the sampler and return the aggregate. Safe to call for an
    /// unknown or already-stopped id.
    pub fn stop_monitoring(&self, execution_id: &str) -> Option<ResourceStats> {
        let monitor = self.active.lock().remove(execution_id)?;
        monitor.task.abort();
        let accum = monitor.accum.lock();
        Some(ResourceStats {
            peak_cpu: accum.peak_cpu,
            peak_heap: accum.peak_heap,
            peak_total: accum.peak_total,
            final_usage: accum.last.clone(),
            average_cpu_percent: if accum.samples == 0 {
                0.0
            } else {
                accum.cpu_percent_sum / accum.samples as f64
            },
            duration: accum.started.elapsed(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
