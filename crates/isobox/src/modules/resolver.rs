//! Allow-listed resolution of module requests.
//!
//! Resolution order: exact allow-list hit for bare specifiers, then `./`/`..`
//! relative to the requesting module within the virtual filesystem, then
//! absolute virtual-filesystem paths. Pure apart from MemFS reads.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
};

use errors::{
    ErrorCode,
    SandboxError,
};
use memfs::{
    path::{
        join_path,
        normalize_path,
        split_parent,
    },
    MemFs,
};

/// A named module source registered with the sandbox.
#[derive(Clone, Debug)]
pub struct ModuleSource {
    pub name: String,
    pub source: String,
}

#[derive(Clone, Debug)]
pub struct ResolvedModule {
    /// Canonical id: the bare name, or the normalised filesystem path.
    pub id: String,
    pub source: String,
}

pub struct ImportResolver {
    registry: HashMap<String, String>,
    /// `None` means every registered name is allowed.
    allowed: Option<HashSet<String>>,
    fs: Arc<MemFs>,
}

impl ImportResolver {
    pub fn new(fs: Arc<MemFs>) -> Self {
        Self {
            registry: HashMap::new(),
            allowed: None,
            fs,
        }
    }

    /// Register a named module; registered names are allowed unless an
    /// explicit allow-list narrows them.
    pub fn register(&mut self, module: ModuleSource) {
        self.registry.insert(module.name, module.source);
    }

    /// Restrict bare-specifier resolution to the given names.
    pub fn set_allow_list(&mut self, names: impl IntoIterator<Item = String>) {
        self.allowed = Some(names.into_iter().collect());
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(
        &self,
        requester_id: &str,
        request: &str,
    ) -> Result<ResolvedModule, SandboxError> {
        if !request.starts_with("./") && !request.starts_with("../") && !request.starts_with('/') {
            // Bare specifier: only the allow-listed registry applies.
            let Some(source) = self.registry.get(request) else {
                return Err(SandboxError::module_not_found(request));
            };
            let allowed = self
                .allowed
                .as_ref()
                .map_or(true, |names| names.contains(request));
            if !allowed {
                return Err(SandboxError::module_forbidden(request));
            }
            return Ok(ResolvedModule {
                id: request.to_string(),
                source: source.clone(),
            });
        }

        let path = if request.starts_with('/') {
            normalize_path(request)
        } else {
            // Resolve against the requesting module's directory; bare-named
            // requesters live at the root.
            let base_dir = split_parent(&normalize_path(requester_id))
                .map(|(parent, _)| parent)
                .unwrap_or_else(|| "/".to_string());
            join_path(&base_dir, request)
        };
        match self.fs.read_to_string(&path) {
            Ok(source) => Ok(ResolvedModule { id: path, source }),
            Err(err) if err.code == ErrorCode::FileNotFound => {
                Err(SandboxError::module_not_found(&path))
            },
            Err(err) => Err(err),
        }
    }
}
