//! Resolved-id → module record mapping. No eviction; one sandbox, one cache.

use std::collections::HashMap;

use crate::guest::ModuleExports;

#[derive(Clone)]
pub struct ModuleRecord {
    pub id: String,
    pub exports: ModuleExports,
    pub loaded: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
}

pub struct ModuleCache {
    entries: HashMap<String, ModuleRecord>,
    stats: ModuleCacheStats,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            stats: ModuleCacheStats::default(),
        }
    }

    pub fn get(&mut self, id: &str) -> Option<ModuleRecord> {
        match self.entries.get(id) {
            Some(record) => {
                self.stats.hits += 1;
                Some(record.clone())
            },
            None => {
                self.stats.misses += 1;
                None
            },
        }
    }

    pub fn set(&mut self, record: ModuleRecord) {
        self.stats.sets += 1;
        self.entries.insert(record.id.clone(), record);
    }

    pub fn mark_loaded(&mut self, id: &str) {
        if let Some(record) = self.entries.get_mut(id) {
            record.loaded = true;
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ModuleCacheStats {
        self.stats
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}
