//! Lightweight named sessions with TTL expiry and a JSON key-value store.

use std::{
    collections::HashMap,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub ttl: Option<Duration>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    ttl: Option<Duration>,
    last_touched: Mutex<Instant>,
    data: Mutex<HashMap<String, JsonValue>>,
}

impl Session {
    pub fn new(id: String, options: SessionOptions) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            ttl: options.ttl,
            last_touched: Mutex::new(now),
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.created_at.elapsed() > ttl,
            None => false,
        }
    }

    pub fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    pub fn idle_time(&self) -> Duration {
        self.last_touched.lock().elapsed()
    }

    pub fn set(&self, key: impl Into<String>, value: JsonValue) {
        self.data.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.data.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<JsonValue> {
        self.data.lock().remove(key)
    }
}
