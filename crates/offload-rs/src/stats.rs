//! Bridge onto simulator statistics.
//!
//! A simulator exposes two operations: reset its counters and report them as JSON. Backends
//! publish a [`StatsBackend`] under their name; callers open a [`StatsBridge`] by name and get
//! an explicit "absent" bridge when nothing was published. Counters are process-wide, so
//! callers clear them before every measured run.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use crate::profiling::{ProfilerStats, SimProfiler};

/// The two operations a simulator exposes for its counters.
pub trait StatsBackend: Send + Sync {
    fn reset(&self);
    fn status_json(&self) -> String;
}

impl StatsBackend for SimProfiler {
    fn reset(&self) {
        self.clear();
    }

    fn status_json(&self) -> String {
        SimProfiler::status_json(self)
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("no simulator statistics backend is loaded")]
    Unavailable,
    #[error("simulator statistics are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

static STATS_BACKENDS: OnceLock<RwLock<HashMap<String, Arc<dyn StatsBackend>>>> = OnceLock::new();

fn stats_backends() -> &'static RwLock<HashMap<String, Arc<dyn StatsBackend>>> {
    STATS_BACKENDS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Publishes `backend` under `name`, replacing an earlier one.
pub fn register_stats_backend(name: impl Into<String>, backend: Arc<dyn StatsBackend>) {
    stats_backends()
        .write()
        .expect("stats registry poisoned")
        .insert(name.into(), backend);
}

pub fn has_stats_backend(name: &str) -> bool {
    stats_backends()
        .read()
        .expect("stats registry poisoned")
        .contains_key(name)
}

/// Handle with an explicit open/clear/read/close lifecycle.
#[derive(Default)]
pub struct StatsBridge {
    backend: Option<Arc<dyn StatsBackend>>,
}

impl StatsBridge {
    pub fn open(backend: Option<Arc<dyn StatsBackend>>) -> Self {
        Self { backend }
    }

    pub fn absent() -> Self {
        Self { backend: None }
    }

    /// Opens the backend published under `name`, or an absent bridge.
    pub fn lookup(name: &str) -> Self {
        let backend = stats_backends()
            .read()
            .expect("stats registry poisoned")
            .get(name)
            .cloned();
        if backend.is_none() {
            tracing::debug!(backend = name, "no statistics backend published");
        }
        Self { backend }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Resets simulator counters. Does nothing when no backend is loaded.
    pub fn clear_stats(&self) {
        if let Some(backend) = &self.backend {
            backend.reset();
        }
    }

    pub fn read_stats(&self) -> Result<ProfilerStats, StatsError> {
        let backend = self.backend.as_ref().ok_or(StatsError::Unavailable)?;
        let raw = backend.status_json();
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn close(&mut self) {
        self.backend = None;
    }
}

impl fmt::Debug for StatsBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsBridge")
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Garbled;

    impl StatsBackend for Garbled {
        fn reset(&self) {}

        fn status_json(&self) -> String {
            "cycle_counter=12".to_string()
        }
    }

    #[test]
    fn absent_bridge_clears_quietly_and_refuses_reads() {
        let bridge = StatsBridge::absent();
        bridge.clear_stats();
        assert!(matches!(bridge.read_stats(), Err(StatsError::Unavailable)));
    }

    #[test]
    fn malformed_status_is_a_parse_error() {
        let bridge = StatsBridge::open(Some(Arc::new(Garbled)));
        assert!(matches!(bridge.read_stats(), Err(StatsError::Parse(_))));
    }

    #[test]
    fn bridge_reads_and_resets_profiler() {
        let profiler = SimProfiler::new();
        let mut bridge = StatsBridge::open(Some(Arc::new(profiler.clone())));
        profiler.record_cycles(0, 9);
        assert_eq!(bridge.read_stats().expect("stats").cycle_counter, 9);
        bridge.clear_stats();
        assert_eq!(bridge.read_stats().expect("stats").cycle_counter, 0);
        bridge.close();
        assert!(!bridge.is_available());
    }

    #[test]
    fn lookup_of_unpublished_name_is_absent() {
        assert!(!StatsBridge::lookup("no-such-simulator").is_available());
        register_stats_backend("stats-test-sim", Arc::new(SimProfiler::new()));
        assert!(StatsBridge::lookup("stats-test-sim").is_available());
        assert!(has_stats_backend("stats-test-sim"));
    }
}
