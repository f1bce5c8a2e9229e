use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;

use crate::backend::accelerator::ExternalRuntime;
use crate::backend::registry::BackendRegistry;
use crate::backend::spec::{BackendError, BackendResult};
use crate::compiler::{Bytecode, Executable, ExecutableCode, ExternalLibrary, HostOp, Reg};
use crate::profiling::SimProfiler;
use crate::runtime::kernels;
use crate::runtime::native::{NativeModule, NativeRuntime};
use crate::tensor::HostTensor;

/// Host execution context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
}

/// Outputs of one run, indexed by result position.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    outputs: Vec<HostTensor>,
}

impl RunResult {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HostTensor> {
        self.outputs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostTensor> {
        self.outputs.iter()
    }

    pub fn into_vec(self) -> Vec<HostTensor> {
        self.outputs
    }
}

impl Index<usize> for RunResult {
    type Output = HostTensor;

    fn index(&self, index: usize) -> &HostTensor {
        &self.outputs[index]
    }
}

/// Register machine executing [`Executable`] bytecode.
///
/// External runtimes are instantiated on the first run and reused afterwards.
pub struct VirtualMachine<'r> {
    code: ExecutableCode,
    library: ExternalLibrary,
    native: Option<Arc<NativeModule>>,
    registry: &'r BackendRegistry,
    device: Device,
    profiler: SimProfiler,
    runtimes: Option<Vec<Box<dyn ExternalRuntime>>>,
}

impl<'r> VirtualMachine<'r> {
    pub fn new(exec: &Executable, registry: &'r BackendRegistry, device: Device) -> Self {
        Self {
            code: exec.code().clone(),
            library: exec.library().clone(),
            native: exec.native().cloned(),
            registry,
            device,
            profiler: SimProfiler::global(),
            runtimes: None,
        }
    }

    /// Charges device cycles to `profiler` instead of the process-wide one.
    pub fn with_profiler(mut self, profiler: SimProfiler) -> Self {
        self.profiler = profiler;
        self.runtimes = None;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn profiler(&self) -> &SimProfiler {
        &self.profiler
    }

    fn instantiate(&self) -> BackendResult<Vec<Box<dyn ExternalRuntime>>> {
        let mut runtimes: Vec<Box<dyn ExternalRuntime>> =
            Vec::with_capacity(self.library.modules.len());
        for module in &self.library.modules {
            let runtime: Box<dyn ExternalRuntime> = match &self.native {
                Some(native) => Box::new(NativeRuntime::bind(
                    Arc::clone(native),
                    module,
                    &self.profiler,
                )?),
                None => {
                    let backend = self.registry.get(&module.compiler).ok_or_else(|| {
                        BackendError::execution(format!(
                            "backend '{}' for module '{}' is not registered",
                            module.compiler, module.symbol
                        ))
                    })?;
                    backend.instantiate(module, &self.profiler)?
                }
            };
            runtimes.push(runtime);
        }
        Ok(runtimes)
    }

    fn bind_inputs(
        &self,
        inputs: &BTreeMap<String, HostTensor>,
        registers: &mut [Option<HostTensor>],
    ) -> BackendResult<()> {
        for name in inputs.keys() {
            if !self.code.inputs.iter().any(|slot| &slot.name == name) {
                return Err(BackendError::execution(format!(
                    "unexpected input '{name}'"
                )));
            }
        }
        for slot in &self.code.inputs {
            let tensor = inputs.get(&slot.name).ok_or_else(|| {
                BackendError::execution(format!("missing input '{}'", slot.name))
            })?;
            if tensor.dtype() != slot.spec.dtype || tensor.dims() != slot.spec.shape.dims() {
                return Err(BackendError::execution(format!(
                    "input '{}' expects {} but got {}",
                    slot.name,
                    slot.spec,
                    tensor.spec()
                )));
            }
            store(registers, slot.reg, tensor.clone())?;
        }
        Ok(())
    }

    /// Executes the entry function with named inputs.
    pub fn run(&mut self, inputs: &BTreeMap<String, HostTensor>) -> BackendResult<RunResult> {
        let mut registers: Vec<Option<HostTensor>> = vec![None; self.code.num_registers as usize];
        self.bind_inputs(inputs, &mut registers)?;
        if self.runtimes.is_none() {
            self.runtimes = Some(self.instantiate()?);
        }

        for instruction in &self.code.instructions {
            match instruction {
                Bytecode::LoadConst { dst, constant } => {
                    let literal = self.code.constants.get(*constant).ok_or_else(|| {
                        BackendError::execution(format!("constant {constant} out of range"))
                    })?;
                    let tensor = HostTensor::from_literal(literal)
                        .map_err(|err| BackendError::execution(err.to_string()))?;
                    store(&mut registers, *dst, tensor)?;
                }
                Bytecode::InvokeHost { op, args, dst } => {
                    let values = gather(&registers, args)?;
                    let result = match (op, values.as_slice()) {
                        (HostOp::Binary(op), [lhs, rhs]) => kernels::binary(*op, lhs, rhs)?,
                        (HostOp::Unary(op), [input]) => kernels::unary(*op, input)?,
                        (HostOp::BiasAdd { axis }, [data, bias]) => {
                            kernels::bias_add(data, bias, *axis)?
                        }
                        (op, values) => {
                            return Err(BackendError::execution(format!(
                                "{op:?} called with {} arguments",
                                values.len()
                            )))
                        }
                    };
                    store(&mut registers, *dst, result)?;
                }
                Bytecode::InvokeExternal { module, args, dsts } => {
                    let values = gather(&registers, args)?
                        .into_iter()
                        .cloned()
                        .collect::<Vec<_>>();
                    let runtime = self
                        .runtimes
                        .as_mut()
                        .and_then(|runtimes| runtimes.get_mut(*module))
                        .ok_or_else(|| {
                            BackendError::execution(format!("module {module} is not loaded"))
                        })?;
                    tracing::debug!(symbol = runtime.symbol(), "invoking external module");
                    let outputs = runtime.invoke(&values)?;
                    if outputs.len() != dsts.len() {
                        return Err(BackendError::execution(format!(
                            "'{}' produced {} outputs, expected {}",
                            runtime.symbol(),
                            outputs.len(),
                            dsts.len()
                        )));
                    }
                    for (dst, tensor) in dsts.iter().zip(outputs) {
                        store(&mut registers, *dst, tensor)?;
                    }
                }
                Bytecode::Ret { results } => {
                    let outputs = gather(&registers, results)?
                        .into_iter()
                        .cloned()
                        .collect();
                    return Ok(RunResult { outputs });
                }
            }
        }
        Err(BackendError::execution("bytecode ended without a return"))
    }
}

fn store(registers: &mut [Option<HostTensor>], reg: Reg, tensor: HostTensor) -> BackendResult<()> {
    let slot = registers
        .get_mut(reg as usize)
        .ok_or_else(|| BackendError::execution(format!("register {reg} out of range")))?;
    *slot = Some(tensor);
    Ok(())
}

fn gather<'a>(
    registers: &'a [Option<HostTensor>],
    regs: &[Reg],
) -> BackendResult<Vec<&'a HostTensor>> {
    regs.iter()
        .map(|reg| {
            registers
                .get(*reg as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| BackendError::execution(format!("register {reg} is empty")))
        })
        .collect()
}
