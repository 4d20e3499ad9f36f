//! Env-overridable tunables.

use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::LazyLock,
};

fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var = match env::var(name) {
        Ok(s) => s,
        Err(_) => return default,
    };
    match T::from_str(&var) {
        Ok(value) => {
            tracing::info!("Overriding {name} to {value:?} from environment");
            value
        },
        Err(e) => {
            tracing::warn!("Invalid value {var} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Watchdog tick cadence (ms): wall-clock and CPU deadlines are enforced
/// within one tick of jitter.
pub static WATCHDOG_TICK_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("ISOBOX_WATCHDOG_TICK_MS", 10));

/// Resource sampler cadence (ms).
pub static MONITOR_TICK_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("ISOBOX_MONITOR_TICK_MS", 10));

/// CPU-vs-wall ratio at which a run counts as an infinite loop.
pub static INFINITE_LOOP_THRESHOLD: LazyLock<f64> =
    LazyLock::new(|| env_config("ISOBOX_INFINITE_LOOP_THRESHOLD", 0.95));

/// Minimum elapsed wall time (ms) before the infinite-loop heuristic applies.
pub static INFINITE_LOOP_MIN_DETECTION_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("ISOBOX_INFINITE_LOOP_MIN_DETECTION_MS", 100));

/// Default idle time (ms) before the pool reaper may evict an isolate.
pub static POOL_IDLE_TIMEOUT_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("ISOBOX_POOL_IDLE_TIMEOUT_MS", 30_000));

/// Smallest heap the guest engine will accept, in whole megabytes.
pub static MIN_ISOLATE_MEMORY_MB: LazyLock<u64> =
    LazyLock::new(|| env_config("ISOBOX_MIN_ISOLATE_MEMORY_MB", 8));
