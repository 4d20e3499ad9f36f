//! Creation and lifecycle tracking of raw isolate handles.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use errors::SandboxError;
use humansize::{
    FormatSize,
    BINARY,
};
use parking_lot::Mutex;

use crate::{
    guest::{
        GuestEngine,
        GuestIsolate,
        IsolateCreateOptions,
    },
    knobs::MIN_ISOLATE_MEMORY_MB,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsolateManagerStats {
    pub created: u64,
    pub disposed: u64,
    pub tracked: usize,
}

struct ManagerState<E: GuestEngine> {
    tracked: HashMap<String, Arc<E::Isolate>>,
    next_seq: u64,
    created: u64,
    disposed: u64,
}

/// Constructs isolates through the engine and tracks every live handle so
/// `dispose_all` can tear a sandbox down without leaks.
pub struct IsolateManager<E: GuestEngine> {
    engine: Arc<E>,
    state: Mutex<ManagerState<E>>,
}

impl<E: GuestEngine> IsolateManager<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            state: Mutex::new(ManagerState {
                tracked: HashMap::new(),
                next_seq: 0,
                created: 0,
                disposed: 0,
            }),
        }
    }

    /// Create and track an isolate. The byte limit is converted to whole
    /// megabytes, floored at the engine minimum.
    pub fn create(
        &self,
        memory_limit_bytes: Option<u64>,
    ) -> anyhow::Result<(String, Arc<E::Isolate>)> {
        let memory_limit_mb = memory_limit_bytes
            .map(|bytes| (bytes / (1024 * 1024)).max(*MIN_ISOLATE_MEMORY_MB))
            .unwrap_or(*MIN_ISOLATE_MEMORY_MB);
        let isolate = Arc::new(
            self.engine
                .create_isolate(&IsolateCreateOptions { memory_limit_mb })?,
        );
        let id = self.generate_id();
        tracing::debug!(
            "Created isolate {id} with {} heap",
            (memory_limit_mb * 1024 * 1024).format_size(BINARY)
        );
        self.track(&id, isolate.clone())?;
        self.state.lock().created += 1;
        Ok((id, isolate))
    }

    pub fn track(&self, id: &str, isolate: Arc<E::Isolate>) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        if state.tracked.contains_key(id) {
            return Err(SandboxError::already_tracked(id));
        }
        state.tracked.insert(id.to_string(), isolate);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<E::Isolate>> {
        self.state.lock().tracked.get(id).cloned()
    }

    pub fn untrack(&self, id: &str) -> Option<Arc<E::Isolate>> {
        self.state.lock().tracked.remove(id)
    }

    /// Dispose a tracked isolate. Unknown ids are a no-op; double-dispose is
    /// the engine's to tolerate and any error is swallowed.
    pub fn dispose(&self, id: &str) {
        if let Some(isolate) = self.untrack(id) {
            if !isolate.is_disposed() {
                isolate.dispose();
            }
            self.state.lock().disposed += 1;
        }
    }

    pub fn dispose_all(&self) {
        let drained: Vec<(String, Arc<E::Isolate>)> = {
            let mut state = self.state.lock();
            state.tracked.drain().collect()
        };
        let count = drained.len() as u64;
        for (id, isolate) in drained {
            tracing::debug!("Disposing isolate {id}");
            if !isolate.is_disposed() {
                isolate.dispose();
            }
        }
        self.state.lock().disposed += count;
    }

    /// `iso-<sequence>-<base36 unix millis>`.
    pub fn generate_id(&self) -> String {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("iso-{seq}-{}", to_base36(millis))
    }

    pub fn stats(&self) -> IsolateManagerStats {
        let state = self.state.lock();
        IsolateManagerStats {
            created: state.created,
            disposed: state.disposed,
            tracked: state.tracked.len(),
        }
    }
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::to_base36;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1234567), "qglj");
    }
}
