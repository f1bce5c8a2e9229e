use std::collections::BTreeMap;
use std::sync::Arc;

use offload_rs::backend::accelerator::{
    AcceleratorBackend, AcceleratorOptions, ExternalModule, ExternalRuntime,
};
use offload_rs::backend::builder::ProgramBuilder;
use offload_rs::backend::ir_utils::tensor_spec;
use offload_rs::backend::op_support::OpSupportRegistry;
use offload_rs::backend::pass_context::PassContext;
use offload_rs::backend::passes::{run_passes, AnnotateTarget, PartitionGraph, ProgramPass};
use offload_rs::backend::registry::BackendRegistry;
use offload_rs::backend::spec::{
    BackendError, BackendResult, DType, ElementwiseUnaryOp, Function, Operand, Operation, Program,
    ValueId,
};
use offload_rs::compiler::{compile_with_options, CompileError, Compiler, Executable};
use offload_rs::profiling::SimProfiler;
use offload_rs::runtime::{kernels, Device, VirtualMachine};
use offload_rs::HostTensor;

/// Backend that evaluates its regions with the host kernels and charges one cycle per
/// element.
struct MirrorBackend;

struct MirrorRuntime {
    function: Function,
    options: AcceleratorOptions,
    profiler: SimProfiler,
}

impl AcceleratorBackend for MirrorBackend {
    fn name(&self) -> &str {
        "mirror"
    }

    fn codegen(
        &self,
        function: &Function,
        options: &AcceleratorOptions,
    ) -> BackendResult<ExternalModule> {
        let graph_json =
            serde_json::to_string(function).map_err(|err| BackendError::execution(err.to_string()))?;
        let specs = |types: &[offload_rs::backend::spec::ValueType]| {
            types
                .iter()
                .map(|ty| ty.as_tensor().cloned().expect("tensor"))
                .collect::<Vec<_>>()
        };
        Ok(ExternalModule {
            symbol: function.name.clone(),
            compiler: "mirror".to_string(),
            graph_json,
            source: String::new(),
            inputs: specs(&function.parameters),
            outputs: specs(&function.results),
            options: options.clone(),
        })
    }

    fn instantiate(
        &self,
        module: &ExternalModule,
        profiler: &SimProfiler,
    ) -> BackendResult<Box<dyn ExternalRuntime>> {
        let function = serde_json::from_str(&module.graph_json)
            .map_err(|err| BackendError::execution(err.to_string()))?;
        Ok(Box::new(MirrorRuntime {
            function,
            options: module.options.clone(),
            profiler: profiler.clone(),
        }))
    }
}

impl ExternalRuntime for MirrorRuntime {
    fn symbol(&self) -> &str {
        &self.function.name
    }

    fn invoke(&mut self, inputs: &[HostTensor]) -> BackendResult<Vec<HostTensor>> {
        let mut values: BTreeMap<ValueId, HostTensor> = self
            .function
            .parameter_ids
            .iter()
            .copied()
            .zip(inputs.iter().cloned())
            .collect();
        let operand = |values: &BTreeMap<ValueId, HostTensor>, operand: &Operand| match operand {
            Operand::Value(id) => values.get(id).cloned().expect("defined"),
            Operand::Literal(literal) => HostTensor::from_literal(literal).expect("literal"),
            Operand::TupleElement { .. } => panic!("no tuples inside regions"),
        };
        for inst in &self.function.body {
            let args = inst
                .operands
                .iter()
                .map(|o| operand(&values, o))
                .collect::<Vec<_>>();
            let out = match &inst.op {
                Operation::ElementwiseBinary(op) => kernels::binary(*op, &args[0], &args[1])?,
                Operation::ElementwiseUnary(op) => kernels::unary(*op, &args[0])?,
                Operation::BiasAdd(spec) => kernels::bias_add(&args[0], &args[1], spec.axis)?,
                other => return Err(BackendError::unimplemented("mirror", other.name())),
            };
            if self.options.profiler_enable {
                self.profiler
                    .record_cycles(self.options.profiler_cycle_counter_id, out.len() as u64);
            }
            values.insert(inst.id, out);
        }
        self.profiler.record_kernel(&self.function.name);
        Ok(self
            .function
            .result_ids
            .iter()
            .map(|id| values[id].clone())
            .collect())
    }
}

fn registry() -> BackendRegistry {
    let registry = BackendRegistry::new();
    registry.register(Arc::new(MirrorBackend));
    registry
}

fn add_then_neg() -> Program {
    let mut builder = ProgramBuilder::new();
    let x = builder
        .parameter("x", tensor_spec(DType::Si32, &[8, 4]))
        .expect("x");
    let y = builder
        .parameter("y", tensor_spec(DType::Si32, &[8, 4]))
        .expect("y");
    let sum = builder.add(x, y).expect("add");
    let neg = builder.unary(ElementwiseUnaryOp::Neg, sum).expect("neg");
    builder.finish_program("main", vec![neg]).expect("program")
}

fn offload(program: &Program) -> Program {
    let support = Arc::new(OpSupportRegistry::new());
    support.register_supported("add", true);
    let annotate = AnnotateTarget::new(support, "mirror");
    let partition = PartitionGraph::new();
    let passes: [&dyn ProgramPass; 2] = [&annotate, &partition];
    run_passes(program, &passes).expect("passes").0
}

fn inputs() -> BTreeMap<String, HostTensor> {
    let x = HostTensor::from_i32(vec![8, 4], (0..32).collect()).expect("x");
    let y = HostTensor::from_i32(vec![8, 4], (0..32).map(|v| v * 3).collect()).expect("y");
    BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)])
}

fn expected() -> HostTensor {
    HostTensor::from_i32(vec![8, 4], (0..32).map(|v| -(v * 4)).collect()).expect("expected")
}

#[test]
fn partitioned_program_runs_through_the_vm() {
    let registry = registry();
    let program = offload(&add_then_neg());
    assert_eq!(program.external_functions().count(), 1);

    let options = AcceleratorOptions::default().with_profiler(0);
    let exec = compile_with_options(&Compiler::new(&registry), &program, "mirror", &options)
        .expect("compile");
    assert_eq!(exec.input_names(), vec!["x", "y"]);

    let profiler = SimProfiler::new();
    let mut vm = VirtualMachine::new(&exec, &registry, Device::Cpu).with_profiler(profiler.clone());
    let result = vm.run(&inputs()).expect("run");
    assert_eq!(result.len(), 1);
    assert_eq!(result[0], expected());
    assert_eq!(profiler.cycles(0), 32);
}

#[test]
fn saved_executable_reloads_and_matches() {
    let registry = registry();
    let program = offload(&add_then_neg());
    let exec = compile_with_options(
        &Compiler::new(&registry),
        &program,
        "mirror",
        &AcceleratorOptions::default(),
    )
    .expect("compile");
    let (code, lib) = exec.save().expect("save");
    let reloaded = Executable::load_exec(&code, lib).expect("reload");

    let before = VirtualMachine::new(&exec, &registry, Device::Cpu)
        .run(&inputs())
        .expect("run");
    let after = VirtualMachine::new(&reloaded, &registry, Device::Cpu)
        .run(&inputs())
        .expect("run reloaded");
    assert_eq!(before, after);

    let dir = tempfile::tempdir().expect("tempdir");
    exec.save_to_dir(dir.path()).expect("save dir");
    let from_disk = Executable::load_from_dir(dir.path()).expect("load dir");
    let again = VirtualMachine::new(&from_disk, &registry, Device::Cpu)
        .run(&inputs())
        .expect("run from disk");
    assert_eq!(before, again);
}

#[test]
fn failed_compile_restores_pass_context() {
    let empty = BackendRegistry::new();
    let program = offload(&add_then_neg());
    let depth = PassContext::depth();
    let err = compile_with_options(
        &Compiler::new(&empty),
        &program,
        "mirror",
        &AcceleratorOptions::default(),
    )
    .expect_err("backend missing");
    assert!(matches!(err, CompileError::UnknownBackend { .. }));
    assert_eq!(PassContext::depth(), depth);
    assert!(PassContext::current().config.is_empty());
}

#[test]
fn options_are_captured_into_the_module() {
    let registry = registry();
    let program = offload(&add_then_neg());
    let options = AcceleratorOptions::default().with_lanes(4).with_profiler(3);
    let exec = compile_with_options(&Compiler::new(&registry), &program, "mirror", &options)
        .expect("compile");
    assert_eq!(exec.library().modules[0].options, options);
}

#[test]
fn vm_rejects_bad_inputs() {
    let registry = registry();
    let exec = Compiler::new(&registry)
        .compile(&add_then_neg())
        .expect("compile host-only");
    let mut vm = VirtualMachine::new(&exec, &registry, Device::Cpu);

    let mut missing = inputs();
    missing.remove("y");
    assert!(vm.run(&missing).is_err());

    let mut extra = inputs();
    extra.insert(
        "z".to_string(),
        HostTensor::from_i32(vec![1], vec![0]).expect("z"),
    );
    assert!(vm.run(&extra).is_err());

    let mut wrong_shape = inputs();
    wrong_shape.insert(
        "x".to_string(),
        HostTensor::from_i32(vec![4, 8], vec![0; 32]).expect("x"),
    );
    assert!(vm.run(&wrong_shape).is_err());

    let mut wrong_dtype = inputs();
    wrong_dtype.insert(
        "x".to_string(),
        HostTensor::from_f32(vec![8, 4], vec![0.0; 32]).expect("x"),
    );
    assert!(vm.run(&wrong_dtype).is_err());

    assert_eq!(vm.run(&inputs()).expect("valid")[0], expected());
}

#[test]
fn reload_rejects_out_of_range_registers() {
    let registry = registry();
    let exec = compile_with_options(
        &Compiler::new(&registry),
        &offload(&add_then_neg()),
        "mirror",
        &AcceleratorOptions::default(),
    )
    .expect("compile");
    let (code, lib) = exec.save().expect("save");

    let mut corrupt = exec.code().clone();
    corrupt.inputs[0].reg = corrupt.num_registers + 5;
    let bytes = bincode::serialize(&corrupt).expect("serialize");
    let err = Executable::load_exec(&bytes, lib.clone()).expect_err("bad input register");
    assert!(matches!(err, CompileError::Invalid(_)), "{err}");

    let mut corrupt = exec.code().clone();
    corrupt.num_registers = 1;
    let bytes = bincode::serialize(&corrupt).expect("serialize");
    let err = Executable::load_exec(&bytes, lib.clone()).expect_err("bad instruction register");
    assert!(matches!(err, CompileError::Invalid(_)), "{err}");

    assert!(Executable::load_exec(&code, lib).is_ok());
}
