use std::collections::HashMap;

use thiserror::Error;

use crate::backend::ir_utils::normalize_axis;
use crate::backend::spec::{
    BiasAddSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, Function, Instruction, Operand,
    Operation, Program, Shape, TensorLiteral, TensorSpec, ValueId, ValueType,
};

/// Errors raised while constructing a function through [`ProgramBuilder`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("value %{0} is not defined")]
    UnknownValue(u32),
    #[error("value %{0} is not a tensor")]
    NotATensor(u32),
    #[error("{op}: operand dtypes differ ({lhs} vs {rhs})")]
    DTypeMismatch {
        op: &'static str,
        lhs: String,
        rhs: String,
    },
    #[error("{op}: operand shapes differ ({lhs} vs {rhs})")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    #[error("nn.bias_add: {0}")]
    InvalidBias(String),
    #[error("literal holds {actual} bytes but {spec} needs {expected}")]
    LiteralSize {
        spec: String,
        expected: usize,
        actual: usize,
    },
    #[error("parameter name '{0}' is declared twice")]
    DuplicateParameter(String),
}

/// Incrementally builds a single function, inferring result types for builtin ops.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, ValueType, String)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, ValueType>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }

    /// Declares a named tensor parameter.
    pub fn parameter(
        &mut self,
        name: impl Into<String>,
        spec: TensorSpec,
    ) -> Result<ValueId, GraphError> {
        let name = name.into();
        if self.parameters.iter().any(|(_, _, existing)| *existing == name) {
            return Err(GraphError::DuplicateParameter(name));
        }
        Ok(self.add_parameter(name, ValueType::Tensor(spec)))
    }

    /// Declares a parameter of any type without name checks. Used by graph rewrites.
    pub fn add_parameter(&mut self, name: impl Into<String>, ty: ValueType) -> ValueId {
        let id = self.fresh_id();
        self.value_types.insert(id, ty.clone());
        self.parameters.push((id, ty, name.into()));
        id
    }

    /// Appends an instruction with a caller-provided output type.
    pub fn emit_single(
        &mut self,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> ValueId {
        let id = self.fresh_id();
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
            target: None,
        });
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    fn tensor_spec(&self, id: ValueId) -> Result<&TensorSpec, GraphError> {
        self.value_types
            .get(&id)
            .ok_or(GraphError::UnknownValue(id.0))?
            .as_tensor()
            .ok_or(GraphError::NotATensor(id.0))
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> Result<ValueId, GraphError> {
        let expected = literal.spec.byte_len().unwrap_or(usize::MAX);
        if expected != literal.byte_len() {
            return Err(GraphError::LiteralSize {
                spec: literal.spec.to_string(),
                expected,
                actual: literal.byte_len(),
            });
        }
        let output = ValueType::Tensor(literal.spec.clone());
        Ok(self.emit_single(Operation::Constant(literal), Vec::new(), output))
    }

    pub fn binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<ValueId, GraphError> {
        let operation = Operation::ElementwiseBinary(op);
        let name = operation.name();
        let lhs_spec = self.tensor_spec(lhs)?;
        let rhs_spec = self.tensor_spec(rhs)?;
        if lhs_spec.dtype != rhs_spec.dtype {
            return Err(GraphError::DTypeMismatch {
                op: name,
                lhs: lhs_spec.dtype.to_string(),
                rhs: rhs_spec.dtype.to_string(),
            });
        }
        if lhs_spec.shape != rhs_spec.shape {
            return Err(GraphError::ShapeMismatch {
                op: name,
                lhs: lhs_spec.shape.clone(),
                rhs: rhs_spec.shape.clone(),
            });
        }
        let output = ValueType::Tensor(lhs_spec.clone());
        Ok(self.emit_single(
            operation,
            vec![Operand::Value(lhs), Operand::Value(rhs)],
            output,
        ))
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, GraphError> {
        self.binary(ElementwiseBinaryOp::Add, lhs, rhs)
    }

    pub fn unary(&mut self, op: ElementwiseUnaryOp, input: ValueId) -> Result<ValueId, GraphError> {
        let output = ValueType::Tensor(self.tensor_spec(input)?.clone());
        Ok(self.emit_single(
            Operation::ElementwiseUnary(op),
            vec![Operand::Value(input)],
            output,
        ))
    }

    /// Adds a rank-1 `bias` to `data` along `axis`.
    pub fn bias_add(
        &mut self,
        data: ValueId,
        bias: ValueId,
        axis: i64,
    ) -> Result<ValueId, GraphError> {
        let data_spec = self.tensor_spec(data)?;
        let bias_spec = self.tensor_spec(bias)?;
        if data_spec.dtype != bias_spec.dtype {
            return Err(GraphError::DTypeMismatch {
                op: "nn.bias_add",
                lhs: data_spec.dtype.to_string(),
                rhs: bias_spec.dtype.to_string(),
            });
        }
        if bias_spec.shape.rank() != 1 {
            return Err(GraphError::InvalidBias(format!(
                "bias must be rank 1, got shape {}",
                bias_spec.shape
            )));
        }
        let resolved = normalize_axis(axis, data_spec.shape.rank()).ok_or_else(|| {
            GraphError::InvalidBias(format!(
                "axis {axis} is out of range for shape {}",
                data_spec.shape
            ))
        })?;
        let extent = data_spec.shape.dims()[resolved];
        if bias_spec.shape.dims()[0] != extent {
            return Err(GraphError::InvalidBias(format!(
                "bias length {} does not match extent {extent} at axis {axis}",
                bias_spec.shape.dims()[0]
            )));
        }
        let output = ValueType::Tensor(data_spec.clone());
        Ok(self.emit_single(
            Operation::BiasAdd(BiasAddSpec { axis }),
            vec![Operand::Value(data), Operand::Value(bias)],
            output,
        ))
    }

    /// Seals the function. Result ids must name values defined in this builder.
    pub fn finish(
        self,
        name: impl Into<String>,
        result_ids: Vec<ValueId>,
    ) -> Result<Function, GraphError> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let ty = self
                .value_types
                .get(id)
                .ok_or(GraphError::UnknownValue(id.0))?;
            results.push(ty.clone());
        }
        let mut parameter_ids = Vec::with_capacity(self.parameters.len());
        let mut parameters = Vec::with_capacity(self.parameters.len());
        let mut parameter_names = Vec::with_capacity(self.parameters.len());
        for (id, ty, name) in self.parameters {
            parameter_ids.push(id);
            parameters.push(ty);
            parameter_names.push(name);
        }
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            parameter_names,
            results,
            body: self.instructions,
            result_ids,
            compiler: None,
        })
    }

    /// Seals the function and wraps it as the entry of a single-function program.
    pub fn finish_program(
        self,
        entry: impl Into<String>,
        result_ids: Vec<ValueId>,
    ) -> Result<Program, GraphError> {
        let entry = entry.into();
        let function = self.finish(entry.clone(), result_ids)?;
        Ok(Program::new(entry).with_functions(vec![function]))
    }
}
