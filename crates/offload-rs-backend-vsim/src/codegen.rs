//! Lowers a partitioned region into a kernel plan and a C shim.

use std::collections::HashMap;
use std::fmt::Write as _;

use offload_rs::backend::accelerator::{AcceleratorOptions, ExternalModule};
use offload_rs::backend::ir_utils::normalize_axis;
use offload_rs::backend::spec::{
    BackendError, BackendResult, DType, ElementwiseBinaryOp, Function, Operand, Operation,
    TensorSpec, ValueId, ValueType,
};
use serde::{Deserialize, Serialize};

use crate::BACKEND_NAME;

/// Where a kernel reads an operand from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Input(usize),
    Step(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    Add,
    /// `rhs[(k / inner) % extent]` is added to element `k`.
    BiasAdd { inner: usize, extent: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStep {
    pub kind: KernelKind,
    pub lhs: Slot,
    pub rhs: Slot,
    pub dims: Vec<usize>,
    pub elements: usize,
}

/// Execution plan stored in [`ExternalModule::graph_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPlan {
    pub symbol: String,
    pub inputs: Vec<TensorSpec>,
    pub steps: Vec<KernelStep>,
    pub outputs: Vec<Slot>,
}

impl KernelPlan {
    pub fn to_json(&self) -> BackendResult<String> {
        serde_json::to_string(self).map_err(|err| BackendError::execution(err.to_string()))
    }

    pub fn from_json(src: &str) -> BackendResult<Self> {
        serde_json::from_str(src).map_err(|err| BackendError::execution(err.to_string()))
    }
}

fn int32_spec<'a>(ty: &'a ValueType, what: &str) -> BackendResult<&'a TensorSpec> {
    let spec = ty
        .as_tensor()
        .ok_or_else(|| BackendError::unimplemented("vsim", format!("{what} is a tuple")))?;
    if spec.dtype != DType::Si32 {
        return Err(BackendError::unimplemented(
            "vsim",
            format!("{what} has dtype {}, only int32 is supported", spec.dtype),
        ));
    }
    Ok(spec)
}

fn element_count(spec: &TensorSpec) -> BackendResult<usize> {
    spec.element_count()
        .ok_or_else(|| BackendError::execution(format!("{spec} overflows")))
}

/// Builds the kernel plan for `function`. Fails on anything the adder cannot run.
pub fn plan(function: &Function) -> BackendResult<KernelPlan> {
    let mut slots: HashMap<ValueId, Slot> = HashMap::new();
    let mut inputs = Vec::with_capacity(function.parameters.len());
    for (index, (id, ty)) in function
        .parameter_ids
        .iter()
        .zip(&function.parameters)
        .enumerate()
    {
        inputs.push(int32_spec(ty, &format!("parameter {index}"))?.clone());
        slots.insert(*id, Slot::Input(index));
    }

    let mut steps = Vec::with_capacity(function.body.len());
    for inst in &function.body {
        let out = int32_spec(&inst.output, &format!("%{}", inst.id.0))?;
        let elements = element_count(out)?;
        let operand = |operand: &Operand| -> BackendResult<Slot> {
            match operand {
                Operand::Value(id) => slots.get(id).copied().ok_or_else(|| {
                    BackendError::execution(format!("%{} is undefined in region", id.0))
                }),
                _ => Err(BackendError::unimplemented(
                    "vsim",
                    "operands must be region values",
                )),
            }
        };
        let (lhs, rhs) = match inst.operands.as_slice() {
            [lhs, rhs] => (operand(lhs)?, operand(rhs)?),
            _ => {
                return Err(BackendError::unimplemented(
                    "vsim",
                    format!("'{}' with {} operands", inst.op.name(), inst.operands.len()),
                ))
            }
        };
        let kind = match &inst.op {
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add) => KernelKind::Add,
            Operation::BiasAdd(spec) => {
                let dims = out.shape.dims();
                let axis = normalize_axis(spec.axis, dims.len()).ok_or_else(|| {
                    BackendError::execution(format!("bias axis {} out of range", spec.axis))
                })?;
                KernelKind::BiasAdd {
                    inner: dims[axis + 1..].iter().product(),
                    extent: dims[axis],
                }
            }
            other => {
                return Err(BackendError::unimplemented(
                    "vsim",
                    format!("operator '{}'", other.name()),
                ))
            }
        };
        slots.insert(inst.id, Slot::Step(steps.len()));
        steps.push(KernelStep {
            kind,
            lhs,
            rhs,
            dims: out.shape.dims().to_vec(),
            elements,
        });
    }

    let outputs = function
        .result_ids
        .iter()
        .map(|id| {
            slots.get(id).copied().ok_or_else(|| {
                BackendError::execution(format!("result %{} is undefined", id.0))
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;

    Ok(KernelPlan {
        symbol: function.name.clone(),
        inputs,
        steps,
        outputs,
    })
}

fn slot_expr(slot: Slot) -> String {
    match slot {
        Slot::Input(index) => format!("in{index}"),
        Slot::Step(index) => format!("s{index}"),
    }
}

/// Emits the native entry point for `plan`, matching `offload_entry_fn`.
pub fn emit_c(plan: &KernelPlan, lanes: u32) -> String {
    let mut src = String::new();
    let _ = writeln!(src, "#include <stdlib.h>\n#include <string.h>\n#include <offload/vsim_kernel.h>\n");
    let _ = writeln!(
        src,
        "int32_t {}(const offload_tensor* inputs, size_t num_inputs, offload_tensor* outputs, \
         size_t num_outputs, uint64_t* cycles) {{",
        plan.symbol
    );
    let _ = writeln!(
        src,
        "  if (num_inputs != {} || num_outputs != {}) return 1;",
        plan.inputs.len(),
        plan.outputs.len()
    );
    for index in 0..plan.inputs.len() {
        let _ = writeln!(src, "  const int32_t* in{index} = (const int32_t*)inputs[{index}].data;");
    }
    for (index, step) in plan.steps.iter().enumerate() {
        let _ = writeln!(
            src,
            "  int32_t* s{index} = (int32_t*)malloc(sizeof(int32_t) * {});",
            step.elements.max(1)
        );
    }
    let _ = writeln!(src, "  uint64_t spent = 0;");
    let _ = writeln!(src, "  int32_t status = 0;");
    for index in 0..plan.steps.len() {
        let _ = writeln!(src, "  if (!s{index}) {{ status = 2; goto done; }}");
    }
    for (index, step) in plan.steps.iter().enumerate() {
        let lhs = slot_expr(step.lhs);
        let rhs = slot_expr(step.rhs);
        match step.kind {
            KernelKind::Add => {
                let _ = writeln!(
                    src,
                    "  spent += vsim_kernel_add({lhs}, {rhs}, s{index}, {}, {lanes});",
                    step.elements
                );
            }
            KernelKind::BiasAdd { inner, extent } => {
                let _ = writeln!(
                    src,
                    "  spent += vsim_kernel_bias_add({lhs}, {rhs}, s{index}, {}, {}, {}, {lanes});",
                    step.elements,
                    inner.max(1),
                    extent.max(1)
                );
            }
        }
    }
    for (index, slot) in plan.outputs.iter().enumerate() {
        let bytes = match slot {
            Slot::Step(step) => plan.steps[*step].elements,
            Slot::Input(input) => plan.inputs[*input].element_count().unwrap_or(0),
        };
        let _ = writeln!(
            src,
            "  memcpy(outputs[{index}].data, {}, sizeof(int32_t) * {bytes});",
            slot_expr(*slot)
        );
    }
    let _ = writeln!(src, "  if (cycles) *cycles += spent;");
    let _ = writeln!(src, "done:");
    for index in 0..plan.steps.len() {
        let _ = writeln!(src, "  free(s{index});");
    }
    let _ = writeln!(src, "  return status;\n}}");
    src
}

/// Full codegen: plan JSON plus C shim, with `options` captured into the module.
pub fn codegen(function: &Function, options: &AcceleratorOptions) -> BackendResult<ExternalModule> {
    if options.lanes == 0 {
        return Err(BackendError::execution("vsim needs at least one lane"));
    }
    let plan = plan(function)?;
    let outputs = function
        .results
        .iter()
        .map(|ty| int32_spec(ty, "result").cloned())
        .collect::<BackendResult<Vec<_>>>()?;
    let source = emit_c(&plan, options.lanes);
    Ok(ExternalModule {
        symbol: function.name.clone(),
        compiler: BACKEND_NAME.to_string(),
        graph_json: plan.to_json()?,
        source,
        inputs: plan.inputs.clone(),
        outputs,
        options: options.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_rs::backend::builder::ProgramBuilder;
    use offload_rs::backend::ir_utils::tensor_spec;
    use offload_rs::backend::spec::ElementwiseUnaryOp;

    fn region(build: impl FnOnce(&mut ProgramBuilder) -> Vec<ValueId>) -> Function {
        let mut builder = ProgramBuilder::new();
        let results = build(&mut builder);
        let mut function = builder.finish("vsim_0", results).expect("function");
        function.compiler = Some(BACKEND_NAME.to_string());
        function
    }

    #[test]
    fn chained_kernels_reference_earlier_steps() {
        let function = region(|b| {
            let x = b.parameter("x", tensor_spec(DType::Si32, &[2, 3])).expect("x");
            let bias = b.parameter("b", tensor_spec(DType::Si32, &[3])).expect("b");
            let sum = b.add(x, x).expect("add");
            vec![b.bias_add(sum, bias, -1).expect("bias")]
        });
        let plan = plan(&function).expect("plan");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].kind, KernelKind::Add);
        assert_eq!(plan.steps[1].lhs, Slot::Step(0));
        assert_eq!(plan.steps[1].rhs, Slot::Input(1));
        assert_eq!(
            plan.steps[1].kind,
            KernelKind::BiasAdd {
                inner: 1,
                extent: 3
            }
        );
        assert_eq!(plan.outputs, vec![Slot::Step(1)]);
        assert_eq!(KernelPlan::from_json(&plan.to_json().expect("json")).expect("parse"), plan);
    }

    #[test]
    fn float_and_unsupported_ops_are_rejected() {
        let float = region(|b| {
            let x = b.parameter("x", tensor_spec(DType::F32, &[4])).expect("x");
            vec![b.add(x, x).expect("add")]
        });
        assert!(matches!(
            plan(&float),
            Err(BackendError::Unimplemented { .. })
        ));

        let neg = region(|b| {
            let x = b.parameter("x", tensor_spec(DType::Si32, &[4])).expect("x");
            vec![b.unary(ElementwiseUnaryOp::Neg, x).expect("neg")]
        });
        assert!(plan(&neg).is_err());
    }

    #[test]
    fn shim_exports_the_region_symbol() {
        let function = region(|b| {
            let x = b.parameter("x", tensor_spec(DType::Si32, &[8, 4])).expect("x");
            let y = b.parameter("y", tensor_spec(DType::Si32, &[8, 4])).expect("y");
            vec![b.add(x, y).expect("add")]
        });
        let module = codegen(&function, &AcceleratorOptions::default().with_lanes(4))
            .expect("codegen");
        assert!(module.source.contains("int32_t vsim_0(const offload_tensor* inputs"));
        assert!(module.source.contains("vsim_kernel_add(in0, in1, s0, 32, 4)"));
        assert_eq!(module.inputs.len(), 2);
        assert_eq!(module.options.lanes, 4);
    }

    #[test]
    fn zero_lanes_fail_codegen() {
        let function = region(|b| {
            let x = b.parameter("x", tensor_spec(DType::Si32, &[1])).expect("x");
            vec![b.add(x, x).expect("add")]
        });
        assert!(codegen(&function, &AcceleratorOptions::default().with_lanes(0)).is_err());
    }
}
