//! Name-keyed registry of accelerator backends.
//!
//! Compilation and execution look backends up by the `compiler` name recorded on
//! partitioned functions. A registry can be built explicitly and passed around, or the
//! process-wide one can be used through the free functions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::backend::accelerator::AcceleratorBackend;

#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<BTreeMap<String, Arc<dyn AcceleratorBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `backend` under its own name, replacing an earlier one.
    pub fn register(&self, backend: Arc<dyn AcceleratorBackend>) {
        let name = backend.name().to_string();
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AcceleratorBackend>> {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(name)
    }

    pub fn list_backends(&self) -> Vec<String> {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list_backends())
            .finish()
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

/// Process-wide registry.
pub fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend in the process-wide registry.
///
/// Backend crates call this from their `register()` function.
pub fn register_backend(backend: Arc<dyn AcceleratorBackend>) {
    global_registry().register(backend);
}

pub fn get_backend(name: &str) -> Option<Arc<dyn AcceleratorBackend>> {
    global_registry().get(name)
}

pub fn has_backend(name: &str) -> bool {
    global_registry().has_backend(name)
}

pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}
