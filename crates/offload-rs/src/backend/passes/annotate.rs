use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::op_support::{OpDescriptor, OpSupportRegistry};
use crate::backend::passes::{PassError, PassResult, ProgramPass};
use crate::backend::spec::{Function, Operation, Program, Target, ValueId, ValueType};

/// Tags every instruction with `External(backend)` when the registry vouches for it,
/// and `Host` otherwise.
pub struct AnnotateTarget {
    registry: Arc<OpSupportRegistry>,
    backend: String,
}

impl AnnotateTarget {
    const NAME: &'static str = "annotate_target";

    pub fn new(registry: Arc<OpSupportRegistry>, backend: impl Into<String>) -> Self {
        Self {
            registry,
            backend: backend.into(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn target_for(&self, desc: &OpDescriptor, op: &Operation) -> Target {
        match op {
            Operation::Constant(_) | Operation::ExternalCall(_) | Operation::TupleGet { .. } => {
                Target::Host
            }
            _ if self.registry.is_supported(&desc.name, desc) => {
                Target::External(self.backend.clone())
            }
            _ => Target::Host,
        }
    }

    fn annotate_function(&self, function: &mut Function) -> PassResult {
        let mut types: HashMap<ValueId, ValueType> = function
            .parameter_ids
            .iter()
            .copied()
            .zip(function.parameters.iter().cloned())
            .collect();
        let mut result = PassResult::default();
        for instruction in &mut function.body {
            let desc = OpDescriptor::from_instruction(instruction, &types);
            let target = self.target_for(&desc, &instruction.op);
            if target.is_external() {
                result.rewrites_applied += 1;
            }
            if instruction.target.as_ref() != Some(&target) {
                result.changed = true;
            }
            tracing::trace!(
                function = %function.name,
                id = instruction.id.0,
                op = %desc.name,
                target = %target,
                "annotated"
            );
            instruction.target = Some(target);
            types.insert(instruction.id, instruction.output.clone());
        }
        result
    }
}

impl ProgramPass for AnnotateTarget {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &Program) -> Result<(Program, PassResult), PassError> {
        let mut annotated = program.clone();
        let mut total = PassResult::default();
        for function in annotated
            .functions
            .iter_mut()
            .filter(|function| !function.is_external())
        {
            total = total.merge(self.annotate_function(function));
        }
        tracing::debug!(
            backend = %self.backend,
            offloaded = total.rewrites_applied,
            "annotation complete"
        );
        Ok((annotated, total))
    }
}
