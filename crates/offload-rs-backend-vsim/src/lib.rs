//! `vsim` accelerator backend: a vector adder driven one clock cycle at a time.
//!
//! Regions are lowered into a [`KernelPlan`]. At run time the plan streams operands through
//! a [`VectorDevice`], either the in-process [`SoftwareDevice`] or a simulator shared object
//! named by [`AcceleratorOptions::lib_path`].

pub mod codegen;
pub mod device;
pub mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use offload_rs::backend::accelerator::{
    AcceleratorBackend, AcceleratorOptions, ExternalModule, ExternalRuntime,
};
use offload_rs::backend::registry::{register_backend, BackendRegistry};
use offload_rs::backend::spec::{BackendResult, Function};
use offload_rs::profiling::SimProfiler;
use offload_rs::stats::register_stats_backend;

pub use codegen::{KernelKind, KernelPlan, KernelStep, Slot};
pub use device::{SharedObjectDevice, SoftwareDevice, VectorDevice};
pub use runtime::VsimRuntime;

pub const BACKEND_NAME: &str = "vsim";

/// Operators the adder can execute.
pub const SUPPORTED_OPS: [&str; 2] = ["add", "nn.bias_add"];

#[derive(Debug, Default, Clone, Copy)]
pub struct VsimBackend;

impl VsimBackend {
    pub fn new() -> Self {
        Self
    }

    fn open_device(options: &AcceleratorOptions) -> BackendResult<Box<dyn VectorDevice>> {
        match &options.lib_path {
            Some(path) => Ok(Box::new(SharedObjectDevice::open(path)?)),
            None => Ok(Box::new(SoftwareDevice::new(options.lanes))),
        }
    }
}

impl AcceleratorBackend for VsimBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn codegen(
        &self,
        function: &Function,
        options: &AcceleratorOptions,
    ) -> BackendResult<ExternalModule> {
        codegen::codegen(function, options)
    }

    fn instantiate(
        &self,
        module: &ExternalModule,
        profiler: &SimProfiler,
    ) -> BackendResult<Box<dyn ExternalRuntime>> {
        let plan = KernelPlan::from_json(&module.graph_json)?;
        let device = Self::open_device(&module.options)?;
        tracing::debug!(
            symbol = %module.symbol,
            lanes = device.lanes(),
            shared_object = module.options.lib_path.is_some(),
            "instantiated vsim module"
        );
        Ok(Box::new(VsimRuntime::new(
            plan,
            device,
            module.options.clone(),
            profiler.clone(),
        )))
    }

    fn include_dirs(&self) -> Vec<PathBuf> {
        vec![include_dir()]
    }
}

/// Directory holding `offload/vsim_kernel.h`.
pub fn include_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("include")
}

/// Adds the backend to `registry`.
pub fn register_vsim_backend(registry: &BackendRegistry) {
    registry.register(Arc::new(VsimBackend::new()));
}

/// Registers the backend globally and publishes the process-wide profiler as its
/// statistics source.
pub fn register() {
    register_backend(Arc::new(VsimBackend::new()));
    register_stats_backend(BACKEND_NAME, Arc::new(SimProfiler::global()));
}
