use std::collections::HashMap;

use crate::backend::accelerator::{AcceleratorOptions, ExternalModule};
use crate::backend::pass_context::{accelerator_options_key, PassContext};
use crate::backend::registry::BackendRegistry;
use crate::backend::spec::{
    Function, Operand, Operation, Program, TensorLiteral, ValueId, ValueType,
};
use crate::backend::validate::validate_program;
use crate::compiler::executable::{
    Bytecode, Executable, ExecutableCode, ExternalLibrary, HostOp, InputSlot, Reg,
    BYTECODE_VERSION,
};
use crate::compiler::CompileError;

/// Turns validated programs into executables using the backends in `registry`.
pub struct Compiler<'a> {
    registry: &'a BackendRegistry,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a BackendRegistry) -> Self {
        Self { registry }
    }

    pub fn compile(&self, program: &Program) -> Result<Executable, CompileError> {
        validate_program(program)?;
        let cx = PassContext::current();
        let library = self.codegen_external(program, &cx)?;
        let entry = program.entry_function().ok_or_else(|| {
            CompileError::Unsupported(format!("missing entry '{}'", program.entry))
        })?;
        if entry.is_external() {
            return Err(CompileError::Unsupported(format!(
                "entry '{}' is an external function",
                entry.name
            )));
        }
        let code = Lowering::new(&library).lower(entry)?;
        tracing::info!(
            entry = %entry.name,
            opt_level = cx.opt_level,
            modules = library.modules.len(),
            instructions = code.instructions.len(),
            "compiled program"
        );
        Ok(Executable::new(code, library))
    }

    fn codegen_external(
        &self,
        program: &Program,
        cx: &PassContext,
    ) -> Result<ExternalLibrary, CompileError> {
        let mut library = ExternalLibrary::default();
        let mut options_cache: HashMap<String, AcceleratorOptions> = HashMap::new();
        for function in program.external_functions() {
            let backend_name = function.compiler.clone().unwrap_or_default();
            let backend = self.registry.get(&backend_name).ok_or_else(|| {
                CompileError::UnknownBackend {
                    function: function.name.clone(),
                    backend: backend_name.clone(),
                }
            })?;
            if !options_cache.contains_key(&backend_name) {
                let key = accelerator_options_key(&backend_name);
                let options = cx
                    .get_config::<AcceleratorOptions>(&key)
                    .map_err(|source| CompileError::Options {
                        backend: backend_name.clone(),
                        source,
                    })?
                    .unwrap_or_else(|| {
                        tracing::warn!(
                            key = %key,
                            "no accelerator options configured, using defaults"
                        );
                        AcceleratorOptions::default()
                    });
                options_cache.insert(backend_name.clone(), options);
            }
            let options = &options_cache[&backend_name];
            let module = backend
                .codegen(function, options)
                .map_err(|source| CompileError::Codegen {
                    symbol: function.name.clone(),
                    source,
                })?;
            tracing::debug!(
                symbol = %module.symbol,
                backend = %backend_name,
                inputs = module.inputs.len(),
                outputs = module.outputs.len(),
                "external codegen finished"
            );
            library.modules.push(module);
        }
        Ok(library)
    }
}

struct Lowering<'l> {
    library: &'l ExternalLibrary,
    module_index: HashMap<&'l str, usize>,
    regs: HashMap<ValueId, Vec<Reg>>,
    next_reg: Reg,
    constants: Vec<TensorLiteral>,
    instructions: Vec<Bytecode>,
}

impl<'l> Lowering<'l> {
    fn new(library: &'l ExternalLibrary) -> Self {
        let module_index = library
            .modules
            .iter()
            .enumerate()
            .map(|(index, module)| (module.symbol.as_str(), index))
            .collect();
        Self {
            library,
            module_index,
            regs: HashMap::new(),
            next_reg: 0,
            constants: Vec::new(),
            instructions: Vec::new(),
        }
    }

    fn fresh(&mut self) -> Reg {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    fn tensor_reg(&self, id: ValueId) -> Result<Reg, CompileError> {
        match self.regs.get(&id).map(Vec::as_slice) {
            Some([reg]) => Ok(*reg),
            Some(_) => Err(CompileError::Unsupported(format!(
                "%{} is a tuple and cannot be used as a tensor",
                id.0
            ))),
            None => Err(CompileError::Unsupported(format!("%{} is undefined", id.0))),
        }
    }

    fn operand_reg(&mut self, operand: &Operand) -> Result<Reg, CompileError> {
        match operand {
            Operand::Value(id) => self.tensor_reg(*id),
            Operand::TupleElement { tuple, index } => self
                .regs
                .get(tuple)
                .and_then(|regs| regs.get(*index))
                .copied()
                .ok_or_else(|| {
                    CompileError::Unsupported(format!("%{}.{} is undefined", tuple.0, index))
                }),
            Operand::Literal(literal) => {
                let dst = self.fresh();
                self.constants.push(literal.clone());
                self.instructions.push(Bytecode::LoadConst {
                    dst,
                    constant: self.constants.len() - 1,
                });
                Ok(dst)
            }
        }
    }

    fn lower(mut self, entry: &Function) -> Result<ExecutableCode, CompileError> {
        let mut inputs = Vec::with_capacity(entry.parameters.len());
        for (index, (id, ty)) in entry
            .parameter_ids
            .iter()
            .zip(entry.parameters.iter())
            .enumerate()
        {
            let ValueType::Tensor(spec) = ty else {
                return Err(CompileError::Unsupported(format!(
                    "entry parameter {index} is a tuple"
                )));
            };
            let reg = self.fresh();
            self.regs.insert(*id, vec![reg]);
            inputs.push(InputSlot {
                name: entry.parameter_name(index),
                spec: spec.clone(),
                reg,
            });
        }

        for instruction in &entry.body {
            let host_op = match &instruction.op {
                Operation::ElementwiseBinary(op) => Some(HostOp::Binary(*op)),
                Operation::ElementwiseUnary(op) => Some(HostOp::Unary(*op)),
                Operation::BiasAdd(spec) => Some(HostOp::BiasAdd { axis: spec.axis }),
                _ => None,
            };
            if let Some(op) = host_op {
                let args = instruction
                    .operands
                    .iter()
                    .map(|operand| self.operand_reg(operand))
                    .collect::<Result<Vec<_>, _>>()?;
                let dst = self.fresh();
                self.instructions.push(Bytecode::InvokeHost { op, args, dst });
                self.regs.insert(instruction.id, vec![dst]);
                continue;
            }

            match &instruction.op {
                Operation::Constant(literal) => {
                    let dst = self.fresh();
                    self.constants.push(literal.clone());
                    self.instructions.push(Bytecode::LoadConst {
                        dst,
                        constant: self.constants.len() - 1,
                    });
                    self.regs.insert(instruction.id, vec![dst]);
                }
                Operation::ExternalCall(spec) => {
                    let module = *self.module_index.get(spec.symbol.as_str()).ok_or_else(|| {
                        CompileError::Unsupported(format!(
                            "external symbol '{}' has no compiled module",
                            spec.symbol
                        ))
                    })?;
                    let args = instruction
                        .operands
                        .iter()
                        .map(|operand| self.operand_reg(operand))
                        .collect::<Result<Vec<_>, _>>()?;
                    let library = self.library;
                    let expected = &library.modules[module];
                    check_arity(expected, args.len())?;
                    let dsts = (0..expected.outputs.len())
                        .map(|_| self.fresh())
                        .collect::<Vec<_>>();
                    self.instructions.push(Bytecode::InvokeExternal {
                        module,
                        args,
                        dsts: dsts.clone(),
                    });
                    self.regs.insert(instruction.id, dsts);
                }
                Operation::TupleGet { index } => {
                    let source = match instruction.operands.as_slice() {
                        [Operand::Value(id)] => *id,
                        _ => {
                            return Err(CompileError::Unsupported(
                                "tuple_get expects one tuple operand".to_string(),
                            ))
                        }
                    };
                    let reg = self
                        .regs
                        .get(&source)
                        .and_then(|regs| regs.get(*index))
                        .copied()
                        .ok_or_else(|| {
                            CompileError::Unsupported(format!(
                                "%{}.{} is undefined",
                                source.0, index
                            ))
                        })?;
                    self.regs.insert(instruction.id, vec![reg]);
                }
                other => {
                    return Err(CompileError::Unsupported(format!(
                        "operation '{}' cannot run on the host",
                        other.name()
                    )))
                }
            }
        }

        let mut outputs = Vec::with_capacity(entry.result_ids.len());
        let mut results = Vec::with_capacity(entry.result_ids.len());
        for (id, ty) in entry.result_ids.iter().zip(entry.results.iter()) {
            let ValueType::Tensor(spec) = ty else {
                return Err(CompileError::Unsupported(format!(
                    "entry result %{} is a tuple",
                    id.0
                )));
            };
            results.push(self.tensor_reg(*id)?);
            outputs.push(spec.clone());
        }
        self.instructions.push(Bytecode::Ret { results });

        Ok(ExecutableCode {
            version: BYTECODE_VERSION.to_string(),
            entry: entry.name.clone(),
            inputs,
            outputs,
            constants: self.constants,
            num_registers: self.next_reg,
            instructions: self.instructions,
        })
    }
}

fn check_arity(module: &ExternalModule, provided: usize) -> Result<(), CompileError> {
    if module.inputs.len() != provided {
        return Err(CompileError::Unsupported(format!(
            "'{}' expects {} inputs, call site passes {provided}",
            module.symbol,
            module.inputs.len()
        )));
    }
    Ok(())
}
