//! CommonJS-style `require` over resolver + cache + cycle tracking.
//!
//! Cycles never fail: a module re-required while still loading observes the
//! in-progress exports object, and sees post-load fields once the outer load
//! finishes — the exports `Arc` is shared, not copied.

mod cache;
mod circular;
mod resolver;

use std::sync::Arc;

use futures::{
    future::BoxFuture,
    FutureExt,
};
use parking_lot::Mutex;
use serde_json::json;

pub use self::{
    cache::{
        ModuleCache,
        ModuleCacheStats,
        ModuleRecord,
    },
    circular::CircularDeps,
    resolver::{
        ImportResolver,
        ModuleSource,
        ResolvedModule,
    },
};
use crate::guest::{
    GuestIsolate,
    HostRequire,
    ModuleExports,
    ModuleInvocation,
};

pub struct ModuleSystem {
    resolver: Mutex<ImportResolver>,
    cache: Mutex<ModuleCache>,
    loading: Mutex<CircularDeps>,
}

impl std::fmt::Debug for ModuleSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSystem").finish_non_exhaustive()
    }
}

impl ModuleSystem {
    pub fn new(resolver: ImportResolver) -> Self {
        Self {
            resolver: Mutex::new(resolver),
            cache: Mutex::new(ModuleCache::new()),
            loading: Mutex::new(CircularDeps::new()),
        }
    }

    pub fn register(&self, module: ModuleSource) {
        self.resolver.lock().register(module);
    }

    pub fn set_allow_list(&self, names: impl IntoIterator<Item = String>) {
        self.resolver.lock().set_allow_list(names);
    }

    pub fn cache_stats(&self) -> ModuleCacheStats {
        self.cache.lock().stats()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Resolve and load a module, returning its (possibly still partial)
    /// exports. Re-entrant: module bodies call back in through the `require`
    /// bridge handed to the guest.
    pub fn require<I: GuestIsolate>(
        self: Arc<Self>,
        isolate: Arc<I>,
        context: I::Context,
        requester_id: String,
        request: String,
    ) -> BoxFuture<'static, anyhow::Result<ModuleExports>> {
        let this = self;
        async move {
            let resolved = this.resolver.lock().resolve(&requester_id, &request)?;

            let exports = {
                let mut cache = this.cache.lock();
                match cache.get(&resolved.id) {
                    Some(record) if record.loaded => return Ok(record.exports),
                    Some(record) => {
                        // Mid-cycle: surface the in-progress exports.
                        let loading = this.loading.lock();
                        if let Some(path) =
                            CircularDeps::circular_path(&resolved.id, loading.stack())
                        {
                            tracing::debug!(
                                "Circular dependency: {} (partial exports returned)",
                                path.join(" -> ")
                            );
                        }
                        return Ok(record.exports);
                    },
                    None => {
                        let exports: ModuleExports = Arc::new(Mutex::new(json!({})));
                        cache.set(ModuleRecord {
                            id: resolved.id.clone(),
                            exports: exports.clone(),
                            loaded: false,
                        });
                        this.loading.lock().start_loading(&resolved.id);
                        exports
                    },
                }
            };

            let bridge: HostRequire = {
                let this = this.clone();
                let isolate = isolate.clone();
                let context = context.clone();
                let requester = resolved.id.clone();
                Arc::new(move |request: String| {
                    this.clone()
                        .require(isolate.clone(), context.clone(), requester.clone(), request)
                })
            };

            let invocation = ModuleInvocation {
                id: resolved.id.clone(),
                source: resolved.source,
                exports: exports.clone(),
                require: bridge,
            };
            let outcome = isolate.evaluate_module(&context, invocation).await;
            this.loading.lock().finish_loading(&resolved.id);
            match outcome {
                Ok(()) => {
                    this.cache.lock().mark_loaded(&resolved.id);
                    Ok(exports)
                },
                Err(err) => {
                    // A failed load must not leave a poisoned placeholder.
                    this.cache.lock().delete(&resolved.id);
                    Err(err)
                },
            }
        }
        .boxed()
    }
}
