//! Structural checks run before compilation.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::backend::spec::{Function, Operand, Operation, Program, ValueId, ValueType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("entry function '{0}' is not defined")]
    MissingEntry(String),
    #[error("function '{0}' is defined more than once")]
    DuplicateFunction(String),
    #[error("function '{function}': value %{id} is defined more than once")]
    DuplicateValue { function: String, id: u32 },
    #[error("function '{function}': %{id} is used before it is defined")]
    UndefinedOperand { function: String, id: u32 },
    #[error("function '{function}': %{tuple}.{index} does not name a tuple element")]
    BadTupleElement {
        function: String,
        tuple: u32,
        index: usize,
    },
    #[error("function '{function}': result %{id} is not defined")]
    UndefinedResult { function: String, id: u32 },
    #[error("function '{function}': {detail}")]
    Signature { function: String, detail: String },
    #[error("function '{function}': external call targets unknown function '{callee}'")]
    UnknownCallee { function: String, callee: String },
}

/// Validates every function in `program` and checks that the entry exists.
pub fn validate_program(program: &Program) -> Result<(), ValidationError> {
    let mut names = HashSet::new();
    for function in &program.functions {
        if !names.insert(function.name.as_str()) {
            return Err(ValidationError::DuplicateFunction(function.name.clone()));
        }
    }
    if program.entry_function().is_none() {
        return Err(ValidationError::MissingEntry(program.entry.clone()));
    }
    for function in &program.functions {
        validate_function(function)?;
        for instruction in &function.body {
            if let Operation::ExternalCall(spec) = &instruction.op {
                if program.function(&spec.function).is_none() {
                    return Err(ValidationError::UnknownCallee {
                        function: function.name.clone(),
                        callee: spec.function.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

pub fn validate_function(function: &Function) -> Result<(), ValidationError> {
    let name = || function.name.clone();
    if function.parameters.len() != function.parameter_ids.len() {
        return Err(ValidationError::Signature {
            function: name(),
            detail: format!(
                "{} parameter types for {} parameter ids",
                function.parameters.len(),
                function.parameter_ids.len()
            ),
        });
    }
    if !function.parameter_names.is_empty()
        && function.parameter_names.len() != function.parameter_ids.len()
    {
        return Err(ValidationError::Signature {
            function: name(),
            detail: "parameter names do not cover every parameter".to_string(),
        });
    }
    if function.results.len() != function.result_ids.len() {
        return Err(ValidationError::Signature {
            function: name(),
            detail: format!(
                "{} result types for {} result ids",
                function.results.len(),
                function.result_ids.len()
            ),
        });
    }

    let mut defined: HashMap<ValueId, &ValueType> = HashMap::new();
    for (id, ty) in function.parameter_ids.iter().zip(&function.parameters) {
        if defined.insert(*id, ty).is_some() {
            return Err(ValidationError::DuplicateValue {
                function: name(),
                id: id.0,
            });
        }
    }
    for instruction in &function.body {
        for operand in &instruction.operands {
            match operand {
                Operand::Value(id) => {
                    if !defined.contains_key(id) {
                        return Err(ValidationError::UndefinedOperand {
                            function: name(),
                            id: id.0,
                        });
                    }
                }
                Operand::TupleElement { tuple, index } => match defined.get(tuple) {
                    None => {
                        return Err(ValidationError::UndefinedOperand {
                            function: name(),
                            id: tuple.0,
                        })
                    }
                    Some(ValueType::Tuple(elements)) if *index < elements.len() => {}
                    Some(_) => {
                        return Err(ValidationError::BadTupleElement {
                            function: name(),
                            tuple: tuple.0,
                            index: *index,
                        })
                    }
                },
                Operand::Literal(_) => {}
            }
        }
        if let Operation::TupleGet { index } = &instruction.op {
            let source = match instruction.operands.as_slice() {
                [Operand::Value(id)] => Some(*id),
                _ => None,
            };
            match source.and_then(|id| defined.get(&id)) {
                Some(ValueType::Tuple(elements)) if *index < elements.len() => {}
                _ => {
                    return Err(ValidationError::BadTupleElement {
                        function: name(),
                        tuple: source.map_or(instruction.id.0, |id| id.0),
                        index: *index,
                    })
                }
            }
        }
        if defined.insert(instruction.id, &instruction.output).is_some() {
            return Err(ValidationError::DuplicateValue {
                function: name(),
                id: instruction.id.0,
            });
        }
    }
    for id in &function.result_ids {
        if !defined.contains_key(id) {
            return Err(ValidationError::UndefinedResult {
                function: name(),
                id: id.0,
            });
        }
    }
    Ok(())
}
