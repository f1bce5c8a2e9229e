//! End-to-end offload harness: place operators on an accelerator backend, compile,
//! run on the VM and compare against independently computed references.

pub mod config;
pub mod reference;
pub mod scenario;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use offload_rs::backend::accelerator::AcceleratorOptions;
use offload_rs::backend::op_support::OpSupportRegistry;
use offload_rs::backend::passes::{run_passes, AnnotateTarget, PartitionGraph, ProgramPass};
use offload_rs::backend::registry::BackendRegistry;
use offload_rs::backend::spec::Program;
use offload_rs::compiler::{
    compile_with_options, export_library, lib_ext, load_module, Compiler, Executable,
    ExportOptions,
};
use offload_rs::hardware::{HardwareBuildManager, HardwareConfig};
use offload_rs::profiling::SimProfiler;
use offload_rs::runtime::{Device, RunResult, VirtualMachine};
use offload_rs::stats::StatsBridge;
use offload_rs::verify::{assert_allclose, Tolerance};
use offload_rs::HostTensor;

pub use config::HarnessConfig;
pub use scenario::{run_scenario, Scenario, ScenarioOutcome, ScenarioStatus};

/// Registers the operators the vector adder accepts.
pub fn register_default_ops(support: &OpSupportRegistry) {
    for op in offload_rs_backend_vsim::SUPPORTED_OPS {
        support.register_supported(op, true);
    }
}

pub fn default_op_support() -> Arc<OpSupportRegistry> {
    let support = Arc::new(OpSupportRegistry::new());
    register_default_ops(&support);
    support
}

fn partition(
    program: &Program,
    support: Arc<OpSupportRegistry>,
    backend: &str,
    partition: PartitionGraph,
) -> Result<Program> {
    let annotate = AnnotateTarget::new(support, backend);
    let passes: [&dyn ProgramPass; 2] = [&annotate, &partition];
    let (program, result) = run_passes(program, &passes)
        .with_context(|| format!("offloading to backend '{backend}'"))?;
    tracing::debug!(
        backend,
        changed = result.changed,
        regions = program.external_functions().count(),
        "offload finished"
    );
    Ok(program)
}

/// Annotates `program` for `backend` and merges supported operators into regions.
pub fn offload(
    program: &Program,
    support: Arc<OpSupportRegistry>,
    backend: &str,
) -> Result<Program> {
    partition(program, support, backend, PartitionGraph::new())
}

/// Like [`offload`], but every supported operator gets its own region.
pub fn offload_per_operator(
    program: &Program,
    support: Arc<OpSupportRegistry>,
    backend: &str,
) -> Result<Program> {
    partition(program, support, backend, PartitionGraph::per_operator())
}

/// Compiles with `options` for `backend`, then saves and reloads the executable so only
/// artifacts that survive serialization are returned.
pub fn compile_module(
    program: &Program,
    registry: &BackendRegistry,
    backend: &str,
    options: &AcceleratorOptions,
) -> Result<Executable> {
    let exec = compile_with_options(&Compiler::new(registry), program, backend, options)
        .with_context(|| format!("compiling for backend '{backend}'"))?;
    let (code, lib) = exec.save()?;
    Executable::load_exec(&code, lib).context("reloading the saved executable")
}

/// Compile path that also rebuilds the backend sources into a native shim under
/// `out_dir` and binds the executable to it.
pub fn compile_module_native(
    program: &Program,
    registry: &BackendRegistry,
    backend: &str,
    options: &AcceleratorOptions,
    out_dir: &Path,
) -> Result<Executable> {
    let exec = compile_with_options(&Compiler::new(registry), program, backend, options)
        .with_context(|| format!("compiling for backend '{backend}'"))?;
    let (code, lib) = exec.save()?;
    let include_dirs = registry
        .get(backend)
        .map(|backend| backend.include_dirs())
        .unwrap_or_default();
    let export = include_dirs
        .into_iter()
        .fold(ExportOptions::default(), |export, dir| export.with_include_dir(dir));
    let path = out_dir.join(format!("{backend}_shim{}", lib_ext()));
    export_library(&lib, &path, &export).context("building the native shim")?;
    let native = load_module(&path)?;
    Executable::load_exec_native(&code, lib, native).context("binding the native shim")
}

/// Runs `exec` once on a fresh VM.
pub fn run_module(
    exec: &Executable,
    registry: &BackendRegistry,
    profiler: &SimProfiler,
    inputs: &BTreeMap<String, HostTensor>,
) -> Result<RunResult> {
    let mut vm = VirtualMachine::new(exec, registry, Device::Cpu).with_profiler(profiler.clone());
    vm.run(inputs).context("execution failed")
}

/// Shared state for a sequence of harness runs.
pub struct HarnessContext {
    pub registry: Arc<BackendRegistry>,
    pub support: Arc<OpSupportRegistry>,
    pub config: HarnessConfig,
    profiler: SimProfiler,
    stats: StatsBridge,
    builds: Option<HardwareBuildManager>,
}

impl HarnessContext {
    /// Uses the process-wide profiler and whatever stats backend `config.backend` published.
    pub fn new(registry: Arc<BackendRegistry>, config: HarnessConfig) -> Self {
        let builds = config
            .hardware_app_dir
            .as_ref()
            .map(|dir| HardwareBuildManager::new(dir.clone()));
        let stats = StatsBridge::lookup(&config.backend);
        Self {
            registry,
            support: default_op_support(),
            config,
            profiler: SimProfiler::global(),
            stats,
            builds,
        }
    }

    /// Registry with the vsim backend and a private profiler wired to the stats bridge.
    pub fn vsim(config: HarnessConfig) -> Self {
        let registry = BackendRegistry::new();
        offload_rs_backend_vsim::register_vsim_backend(&registry);
        Self::new(Arc::new(registry), config).with_profiler(SimProfiler::new())
    }

    pub fn with_profiler(mut self, profiler: SimProfiler) -> Self {
        self.stats = StatsBridge::open(Some(Arc::new(profiler.clone())));
        self.profiler = profiler;
        self
    }

    pub fn with_build_manager(mut self, builds: HardwareBuildManager) -> Self {
        self.builds = Some(builds);
        self
    }

    pub fn with_support(mut self, support: Arc<OpSupportRegistry>) -> Self {
        self.support = support;
        self
    }

    pub fn profiler(&self) -> &SimProfiler {
        &self.profiler
    }

    pub fn stats(&self) -> &StatsBridge {
        &self.stats
    }

    pub fn backend_available(&self) -> bool {
        self.registry.has_backend(&self.config.backend)
    }

    /// Hardware library for `lanes`, built on demand when an app directory is configured.
    pub fn library_for(&self, lanes: u32) -> Result<Option<PathBuf>> {
        let Some(builds) = &self.builds else {
            return Ok(None);
        };
        let config = HardwareConfig::new(self.config.library_name.clone(), lanes);
        let path = builds
            .ensure_built(&config)
            .with_context(|| format!("building hardware for {} lanes", lanes))?;
        Ok(Some(path))
    }

    pub fn options_for(&self, lanes: u32) -> Result<AcceleratorOptions> {
        let lib_path = self.library_for(lanes)?;
        Ok(self.config.accelerator_options(lanes, lib_path))
    }

    pub fn offload(&self, program: &Program) -> Result<Program> {
        offload(program, Arc::clone(&self.support), &self.config.backend)
    }

    pub fn compile(&self, program: &Program, lanes: u32) -> Result<Executable> {
        let options = self.options_for(lanes)?;
        compile_module(program, &self.registry, &self.config.backend, &options)
    }

    pub fn run(&self, exec: &Executable, inputs: &BTreeMap<String, HostTensor>) -> Result<RunResult> {
        run_module(exec, &self.registry, &self.profiler, inputs)
    }

    /// Clears simulator stats, runs `exec`, checks every output against `references` and
    /// returns the cycle counter when stats are available.
    pub fn run_and_check(
        &self,
        exec: &Executable,
        inputs: &BTreeMap<String, HostTensor>,
        references: &[HostTensor],
    ) -> Result<Option<u64>> {
        self.stats.clear_stats();
        let result = self.run(exec, inputs)?;
        let cycles = if self.stats.is_available() {
            Some(self.stats.read_stats()?.cycle_counter)
        } else {
            None
        };
        check_outputs(&result, references, self.config.tolerance)?;
        Ok(cycles)
    }
}

/// Compares every output with its reference.
pub fn check_outputs(result: &RunResult, references: &[HostTensor], tolerance: Tolerance) -> Result<()> {
    if result.len() != references.len() {
        return Err(anyhow!(
            "run produced {} outputs, {} references given",
            result.len(),
            references.len()
        ));
    }
    for (index, (actual, desired)) in result.iter().zip(references).enumerate() {
        assert_allclose(actual, desired, tolerance)
            .with_context(|| format!("output {index} does not match the reference"))?;
    }
    Ok(())
}
