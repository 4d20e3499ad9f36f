//! Path-prefix subscriptions over filesystem mutations.

use std::{
    collections::HashMap,
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::Arc,
};

use parking_lot::Mutex;

use crate::path::path_segments;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsEventKind {
    Create,
    Modify,
    Delete,
}

#[derive(Clone, Debug)]
pub struct FsEvent {
    /// Normalised path the mutation applied to.
    pub path: String,
    pub kind: FsEventKind,
}

pub type WatchCallback = Arc<dyn Fn(&FsEvent) + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WatchId(u64);

struct Subscription {
    prefix: Vec<String>,
    callback: WatchCallback,
}

/// Subscription registry. A subscription at `P` fires for any event whose
/// path equals `P` or has `P` as a directory ancestor; matching is on path
/// segments, not substrings, so `/foo` does not match `/foobar`.
pub struct FsWatcher {
    state: Mutex<WatcherState>,
}

struct WatcherState {
    next_id: u64,
    subscriptions: HashMap<WatchId, Subscription>,
}

impl FsWatcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WatcherState {
                next_id: 0,
                subscriptions: HashMap::new(),
            }),
        }
    }

    /// Subscribe a callback under a (normalised) path prefix. Multiple
    /// subscribers per path are allowed.
    pub fn subscribe(&self, path: &str, callback: WatchCallback) -> WatchId {
        let prefix = path_segments(&crate::path::normalize_path(path))
            .into_iter()
            .map(String::from)
            .collect();
        let mut state = self.state.lock();
        let id = WatchId(state.next_id);
        state.next_id += 1;
        state.subscriptions.insert(id, Subscription { prefix, callback });
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: WatchId) -> bool {
        self.state.lock().subscriptions.remove(&id).is_some()
    }

    /// Deliver an event to every matching subscriber. Callback panics are
    /// swallowed and logged; they never propagate to the mutator.
    pub fn notify(&self, event: &FsEvent) {
        let event_segments: Vec<&str> = path_segments(&event.path);
        let matching: Vec<WatchCallback> = {
            let state = self.state.lock();
            state
                .subscriptions
                .values()
                .filter(|sub| {
                    sub.prefix.len() <= event_segments.len()
                        && sub
                            .prefix
                            .iter()
                            .zip(event_segments.iter())
                            .all(|(a, b)| a == b)
                })
                .map(|sub| sub.callback.clone())
                .collect()
        };
        for callback in matching {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                tracing::warn!("Watch callback panicked for {}: {panic:?}", event.path);
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.state.lock().subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
