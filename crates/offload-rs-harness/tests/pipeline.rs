use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use offload_rs::backend::op_support::OpSupportRegistry;
use offload_rs::backend::registry::BackendRegistry;
use offload_rs::hardware::{BuildError, BuildRunner, HardwareBuildManager, HardwareConfig};
use offload_rs::HostTensor;
use offload_rs_harness::{
    compile_module_native, offload_per_operator, run_scenario, HarnessConfig, HarnessContext,
    Scenario, ScenarioStatus,
};

fn context() -> HarnessContext {
    HarnessContext::vsim(HarnessConfig::default())
}

#[test]
fn add_counts_one_cycle_per_lane_chunk() {
    let cx = context();
    for (lanes, cycles) in [(1u32, 32u64), (2, 16), (32, 1)] {
        match run_scenario(&cx, &Scenario::add(&[8, 4]), lanes).expect("scenario") {
            ScenarioStatus::Passed(outcome) => {
                assert_eq!(outcome.op, "add");
                assert_eq!(outcome.cycles, Some(cycles), "lanes {lanes}");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}

#[test]
fn bias_add_cycles_shrink_with_wider_vectors() {
    let cx = context();
    let scenario = Scenario::bias_add(&[1, 112, 112, 32], &[32], 3);
    let narrow = run_scenario(&cx, &scenario, 1).expect("one lane");
    let wide = run_scenario(&cx, &scenario, 32).expect("32 lanes");
    let cycles = |status: ScenarioStatus| match status {
        ScenarioStatus::Passed(outcome) => outcome.cycles,
        other => panic!("unexpected status {other:?}"),
    };
    assert_eq!(cycles(narrow), Some(112 * 112 * 32));
    assert_eq!(cycles(wide), Some(112 * 112));
}

#[test]
fn missing_backend_skips_the_scenario() {
    let cx = HarnessContext::new(Arc::new(BackendRegistry::new()), HarnessConfig::default());
    let status = run_scenario(&cx, &Scenario::add(&[8, 4]), 1).expect("scenario");
    assert!(matches!(status, ScenarioStatus::Skipped { .. }));
}

#[test]
fn nothing_supported_runs_entirely_on_the_host() {
    let cx = context().with_support(Arc::new(OpSupportRegistry::new()));
    let scenario = Scenario::add(&[8, 4]);
    let program = cx.offload(&scenario.program().expect("program")).expect("offload");
    assert_eq!(program.external_functions().count(), 0);

    let exec = cx.compile(&program, 2).expect("compile");
    let inputs = scenario.inputs(7, 5).expect("inputs");
    let expected = scenario.reference(&inputs).expect("reference");
    let cycles = cx
        .run_and_check(&exec, &inputs, &[expected])
        .expect("host run matches");
    assert_eq!(cycles, Some(0));
}

#[test]
fn per_operator_offload_splits_chained_adds() {
    let cx = context();
    let mut builder = offload_rs::backend::builder::ProgramBuilder::new();
    let spec = offload_rs::backend::ir_utils::tensor_spec(offload_rs::DType::Si32, &[4]);
    let x = builder.parameter("x", spec.clone()).expect("x");
    let y = builder.parameter("y", spec).expect("y");
    let s = builder.add(x, y).expect("first add");
    let t = builder.add(s, y).expect("second add");
    let program = builder.finish_program("main", vec![t]).expect("program");

    let merged = cx.offload(&program).expect("merged");
    let split = offload_per_operator(&program, Arc::clone(&cx.support), &cx.config.backend)
        .expect("split");
    assert_eq!(merged.external_functions().count(), 1);
    assert_eq!(split.external_functions().count(), 2);

    let x = HostTensor::from_i32(vec![4], vec![1, 2, 3, 4]).expect("x");
    let y = HostTensor::from_i32(vec![4], vec![10, 10, 10, 10]).expect("y");
    let inputs = BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)]);
    let expected = HostTensor::from_i32(vec![4], vec![21, 22, 23, 24]).expect("expected");
    for program in [merged, split] {
        let exec = cx.compile(&program, 4).expect("compile");
        let cycles = cx
            .run_and_check(&exec, &inputs, std::slice::from_ref(&expected))
            .expect("run");
        assert_eq!(cycles, Some(2));
    }
}

#[test]
fn interleaved_regions_run_in_dependency_order() {
    use offload_rs::backend::spec::ElementwiseUnaryOp;

    let cx = context();
    let mut builder = offload_rs::backend::builder::ProgramBuilder::new();
    let spec = offload_rs::backend::ir_utils::tensor_spec(offload_rs::DType::Si32, &[4]);
    let x = builder.parameter("x", spec.clone()).expect("x");
    let y = builder.parameter("y", spec).expect("y");
    let a = builder.add(x, x).expect("a");
    let b = builder.add(y, y).expect("b");
    let h1 = builder.unary(ElementwiseUnaryOp::Neg, a).expect("h1");
    let c = builder.add(b, h1).expect("c");
    let h2 = builder.unary(ElementwiseUnaryOp::Neg, b).expect("h2");
    let d = builder.add(a, h2).expect("d");
    let program = builder.finish_program("main", vec![c, d]).expect("program");

    let partitioned = cx.offload(&program).expect("offload");
    assert_eq!(partitioned.external_functions().count(), 3);

    let exec = cx.compile(&partitioned, 4).expect("compile");
    let x = HostTensor::from_i32(vec![4], vec![1, 2, 3, 4]).expect("x");
    let y = HostTensor::from_i32(vec![4], vec![10, 20, 30, 40]).expect("y");
    let inputs = BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)]);
    let c = HostTensor::from_i32(vec![4], vec![18, 36, 54, 72]).expect("c");
    let d = HostTensor::from_i32(vec![4], vec![-18, -36, -54, -72]).expect("d");
    let cycles = cx.run_and_check(&exec, &inputs, &[c, d]).expect("run");
    assert_eq!(cycles, Some(4));
}

#[test]
fn execution_errors_keep_their_source() {
    let cx = context();
    let scenario = Scenario::add(&[2, 2]);
    let program = cx.offload(&scenario.program().expect("program")).expect("offload");
    let exec = cx.compile(&program, 1).expect("compile");
    let err = cx.run(&exec, &BTreeMap::new()).expect_err("inputs missing");
    assert_eq!(err.to_string(), "execution failed");
    assert!(err
        .root_cause()
        .downcast_ref::<offload_rs::backend::spec::BackendError>()
        .is_some());
    assert!(format!("{err:#}").contains("missing input"));
}

#[test]
fn wrong_reference_is_reported() {
    let cx = context();
    let scenario = Scenario::add(&[2, 2]);
    let program = cx.offload(&scenario.program().expect("program")).expect("offload");
    let exec = cx.compile(&program, 1).expect("compile");
    let inputs = scenario.inputs(0, 5).expect("inputs");
    let wrong = HostTensor::from_i32(vec![2, 2], vec![-1; 4]).expect("wrong");
    let err = cx
        .run_and_check(&exec, &inputs, &[wrong])
        .expect_err("mismatch");
    assert!(format!("{err:#}").contains("does not match"));
}

/// Writes an empty file where the hardware library would go and counts invocations.
struct TouchRunner {
    calls: Arc<AtomicUsize>,
}

impl BuildRunner for TouchRunner {
    fn build(&self, app_dir: &Path, config: &HardwareConfig) -> Result<(), BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(app_dir.join(config.artifact_file_name()), b"")
            .map_err(|err| BuildError::Failed {
                status: "io".to_string(),
                stderr: err.to_string(),
            })
    }
}

#[test]
fn hardware_library_is_built_once_per_lane_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let builds = HardwareBuildManager::with_runner(
        dir.path(),
        TouchRunner {
            calls: Arc::clone(&calls),
        },
    );
    let cx = context().with_build_manager(builds);

    let first = cx.options_for(2).expect("first");
    let second = cx.options_for(2).expect("second");
    assert_eq!(first.lib_path, second.lib_path);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let other = cx.options_for(4).expect("other");
    assert_ne!(other.lib_path, first.lib_path);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let lib_path = first.lib_path.expect("lib path");
    let file_name = lib_path.file_name().and_then(|name| name.to_str()).expect("name");
    assert!(file_name.starts_with("libvsim_2"));
    assert_eq!(first.lanes, 2);
    assert!(first.profiler_enable);
}

fn tool_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn have_c_compiler() -> bool {
    tool_available(&std::env::var("CC").unwrap_or_else(|_| "cc".to_string()))
}

#[test]
fn native_shim_matches_the_reference() {
    if !have_c_compiler() {
        eprintln!("skipping native shim test: no C compiler available");
        return;
    }
    let cx = context();
    let scenario = Scenario::bias_add(&[2, 4, 4, 8], &[8], 3);
    let program = cx.offload(&scenario.program().expect("program")).expect("offload");
    let options = cx.options_for(8).expect("options");
    let dir = tempfile::tempdir().expect("tempdir");
    let exec = compile_module_native(&program, &cx.registry, &cx.config.backend, &options, dir.path())
        .expect("native compile");

    let inputs = scenario.inputs(3, 5).expect("inputs");
    let expected = scenario.reference(&inputs).expect("reference");
    let cycles = cx.run_and_check(&exec, &inputs, &[expected]).expect("run");
    assert_eq!(cycles, Some(2 * 4 * 4));
}

#[test]
fn makefile_hardware_drives_the_scenario() {
    if !have_c_compiler() || !tool_available(&offload_rs::env::make_program()) {
        eprintln!("skipping hardware build test: make or a C compiler is missing");
        return;
    }
    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../hardware/vadd");
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("src")).expect("src dir");
    std::fs::copy(source.join("Makefile"), dir.path().join("Makefile")).expect("Makefile");
    std::fs::copy(source.join("src/device.c"), dir.path().join("src/device.c")).expect("device.c");

    let config = HarnessConfig {
        hardware_app_dir: Some(dir.path().to_path_buf()),
        ..HarnessConfig::default()
    };
    let cx = HarnessContext::vsim(config);
    match run_scenario(&cx, &Scenario::add(&[8, 4]), 2).expect("scenario") {
        ScenarioStatus::Passed(outcome) => assert_eq!(outcome.cycles, Some(16)),
        other => panic!("unexpected status {other:?}"),
    }
    let artifact = HardwareConfig::new("vsim", 2).artifact_file_name();
    assert!(dir.path().join(artifact).is_file());
}
