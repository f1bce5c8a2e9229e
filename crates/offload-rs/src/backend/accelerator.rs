//! Contract between the compiler and accelerator backends.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{BackendResult, Function, TensorSpec};
use crate::profiling::SimProfiler;
use crate::tensor::HostTensor;

fn default_lanes() -> u32 {
    1
}

/// Per-backend options threaded through the pass context during compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorOptions {
    /// Prebuilt simulator library. `None` selects the backend's in-process device model.
    #[serde(default)]
    pub lib_path: Option<PathBuf>,
    /// Vector width of the in-process device model.
    #[serde(default = "default_lanes")]
    pub lanes: u32,
    #[serde(default)]
    pub profiler_enable: bool,
    #[serde(default)]
    pub profiler_cycle_counter_id: u32,
}

impl Default for AcceleratorOptions {
    fn default() -> Self {
        Self {
            lib_path: None,
            lanes: default_lanes(),
            profiler_enable: false,
            profiler_cycle_counter_id: 0,
        }
    }
}

impl AcceleratorOptions {
    pub fn with_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lib_path = Some(path.into());
        self
    }

    pub fn with_lanes(mut self, lanes: u32) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_profiler(mut self, counter_id: u32) -> Self {
        self.profiler_enable = true;
        self.profiler_cycle_counter_id = counter_id;
        self
    }
}

/// Result of running backend codegen over one partitioned region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalModule {
    /// Exported symbol; matches the region function name.
    pub symbol: String,
    /// Backend that produced (and later instantiates) the module.
    pub compiler: String,
    /// Backend-private execution plan.
    pub graph_json: String,
    /// C translation unit for the native shim path. Empty when the backend has none.
    pub source: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    /// Options captured at compile time so reloaded executables behave the same.
    pub options: AcceleratorOptions,
}

/// Instantiated module ready to execute.
pub trait ExternalRuntime: Send {
    fn symbol(&self) -> &str;
    fn invoke(&mut self, inputs: &[HostTensor]) -> BackendResult<Vec<HostTensor>>;
}

/// Accelerator backend: turns partitioned regions into external modules and runs them.
pub trait AcceleratorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn codegen(
        &self,
        function: &Function,
        options: &AcceleratorOptions,
    ) -> BackendResult<ExternalModule>;

    fn instantiate(
        &self,
        module: &ExternalModule,
        profiler: &SimProfiler,
    ) -> BackendResult<Box<dyn ExternalRuntime>>;

    /// Header directories the native shim source needs.
    fn include_dirs(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_use_wire_field_names() {
        let options = AcceleratorOptions::default()
            .with_lib_path("/tmp/libvadd_4.so")
            .with_profiler(0);
        let value = serde_json::to_value(&options).expect("serialize");
        assert_eq!(value["lib_path"], "/tmp/libvadd_4.so");
        assert_eq!(value["profiler_enable"], true);
        assert_eq!(value["profiler_cycle_counter_id"], 0);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let options: AcceleratorOptions =
            serde_json::from_str(r#"{"profiler_enable": true}"#).expect("parse");
        assert_eq!(options.lanes, 1);
        assert!(options.lib_path.is_none());
        assert!(options.profiler_enable);
    }
}
