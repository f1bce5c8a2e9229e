//! Simulated hardware performance counters.
//!
//! Backends charge device cycles to numbered counters on a [`SimProfiler`]. The
//! process-wide instance is what the stats bridge reads by default; tests that run in
//! parallel hand each VM its own handle instead.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct Counters {
    cycles: BTreeMap<u32, u64>,
    kernel_calls: BTreeMap<String, u64>,
}

/// Cloneable handle onto a set of cycle counters.
#[derive(Debug, Clone, Default)]
pub struct SimProfiler {
    inner: Arc<Mutex<Counters>>,
}

/// Parsed counter snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerStats {
    /// Cycles summed over every counter.
    pub cycle_counter: u64,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub kernel_calls: BTreeMap<String, u64>,
}

impl ProfilerStats {
    pub fn counter(&self, id: u32) -> u64 {
        self.counters.get(&id.to_string()).copied().unwrap_or(0)
    }
}

impl SimProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide profiler shared by every VM that was not given its own.
    pub fn global() -> Self {
        static INSTANCE: OnceLock<SimProfiler> = OnceLock::new();
        INSTANCE.get_or_init(SimProfiler::new).clone()
    }

    pub fn same_as(&self, other: &SimProfiler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn record_cycles(&self, counter_id: u32, cycles: u64) {
        let mut counters = self.inner.lock().expect("profiler mutex poisoned");
        let slot = counters.cycles.entry(counter_id).or_insert(0);
        *slot = slot.saturating_add(cycles);
    }

    pub fn record_kernel(&self, name: &str) {
        let mut counters = self.inner.lock().expect("profiler mutex poisoned");
        *counters.kernel_calls.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn cycles(&self, counter_id: u32) -> u64 {
        self.inner
            .lock()
            .expect("profiler mutex poisoned")
            .cycles
            .get(&counter_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut counters = self.inner.lock().expect("profiler mutex poisoned");
        counters.cycles.clear();
        counters.kernel_calls.clear();
    }

    pub fn snapshot(&self) -> ProfilerStats {
        let counters = self.inner.lock().expect("profiler mutex poisoned");
        ProfilerStats {
            cycle_counter: counters
                .cycles
                .values()
                .fold(0u64, |acc, value| acc.saturating_add(*value)),
            counters: counters
                .cycles
                .iter()
                .map(|(id, value)| (id.to_string(), *value))
                .collect(),
            kernel_calls: counters.kernel_calls.clone(),
        }
    }

    /// Current counters encoded as JSON.
    pub fn status_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_clear() {
        let profiler = SimProfiler::new();
        profiler.record_cycles(0, 32);
        profiler.record_cycles(0, 8);
        profiler.record_cycles(3, 1);
        profiler.record_kernel("add");
        let stats = profiler.snapshot();
        assert_eq!(stats.cycle_counter, 41);
        assert_eq!(stats.counter(0), 40);
        assert_eq!(stats.kernel_calls.get("add"), Some(&1));

        profiler.clear();
        assert_eq!(profiler.snapshot(), ProfilerStats::default());
    }

    #[test]
    fn status_json_parses_back() {
        let profiler = SimProfiler::new();
        profiler.record_cycles(0, 5);
        let parsed: ProfilerStats =
            serde_json::from_str(&profiler.status_json()).expect("valid json");
        assert_eq!(parsed.cycle_counter, 5);
    }

    #[test]
    fn handles_share_counters() {
        let profiler = SimProfiler::new();
        let alias = profiler.clone();
        alias.record_cycles(1, 2);
        assert_eq!(profiler.cycles(1), 2);
        assert!(alias.same_as(&profiler));
        assert!(!SimProfiler::new().same_as(&profiler));
    }
}
