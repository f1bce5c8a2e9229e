//! Operator descriptors and the accelerator support registry.
//!
//! Predicates are pure functions over an [`OpDescriptor`], so they can be tested without
//! building a graph. Lookups are default-closed: an operator nobody registered is never
//! offloaded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::backend::spec::{DType, Instruction, Operand, Operation, TensorSpec, ValueId, ValueType};

/// Typed view of one operator instance: only what support predicates need.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDescriptor {
    pub name: String,
    pub dtype: Option<DType>,
    pub input_specs: Vec<TensorSpec>,
    pub output_spec: Option<TensorSpec>,
    /// Operator attributes keyed by name. Ordered, so iteration never depends on hashing.
    pub attrs: BTreeMap<String, Value>,
}

impl OpDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: None,
            input_specs: Vec::new(),
            output_spec: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_input(mut self, spec: TensorSpec) -> Self {
        self.input_specs.push(spec);
        self
    }

    pub fn with_output(mut self, spec: TensorSpec) -> Self {
        self.dtype = Some(spec.dtype);
        self.output_spec = Some(spec);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Describes `instruction`, resolving operand types through `types`.
    ///
    /// Operands whose type is unknown or not a tensor are left out of `input_specs`.
    pub fn from_instruction(
        instruction: &Instruction,
        types: &HashMap<ValueId, ValueType>,
    ) -> Self {
        let input_specs = instruction
            .operands
            .iter()
            .filter_map(|operand| match operand {
                Operand::Value(id) => types.get(id).and_then(ValueType::as_tensor).cloned(),
                Operand::TupleElement { tuple, index } => match types.get(tuple) {
                    Some(ValueType::Tuple(elements)) => {
                        elements.get(*index).and_then(ValueType::as_tensor).cloned()
                    }
                    _ => None,
                },
                Operand::Literal(literal) => Some(literal.spec.clone()),
            })
            .collect();
        let output_spec = instruction.output.as_tensor().cloned();

        let mut attrs = BTreeMap::new();
        match &instruction.op {
            Operation::BiasAdd(spec) => {
                attrs.insert("axis".to_string(), Value::from(spec.axis));
            }
            Operation::ExternalCall(spec) => {
                attrs.insert("compiler".to_string(), Value::from(spec.compiler.clone()));
                attrs.insert("symbol".to_string(), Value::from(spec.symbol.clone()));
            }
            _ => {}
        }

        Self {
            name: instruction.op.name().to_string(),
            dtype: output_spec.as_ref().map(|spec| spec.dtype),
            input_specs,
            output_spec,
            attrs,
        }
    }

    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(Value::as_i64)
    }
}

/// Support predicate over an operator descriptor.
pub type OpPredicate = Arc<dyn Fn(&OpDescriptor) -> bool + Send + Sync>;

/// Explicit operator-name to predicate mapping consulted by annotation.
#[derive(Default)]
pub struct OpSupportRegistry {
    predicates: RwLock<BTreeMap<String, OpPredicate>>,
}

impl OpSupportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `predicate` under `name`, replacing any earlier entry.
    pub fn register<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&OpDescriptor) -> bool + Send + Sync + 'static,
    {
        self.predicates
            .write()
            .expect("op support registry lock poisoned")
            .insert(name.into(), Arc::new(predicate));
    }

    /// Registers a predicate that ignores attributes and always answers `supported`.
    pub fn register_supported(&self, name: impl Into<String>, supported: bool) {
        self.register(name, move |_| supported);
    }

    /// Evaluates the predicate for `name`. Unregistered operators are unsupported.
    pub fn is_supported(&self, name: &str, desc: &OpDescriptor) -> bool {
        let predicate = {
            let predicates = self
                .predicates
                .read()
                .expect("op support registry lock poisoned");
            match predicates.get(name) {
                Some(predicate) => Arc::clone(predicate),
                None => return false,
            }
        };
        predicate(desc)
    }

    /// Convenience form of [`Self::is_supported`] keyed by the descriptor's own name.
    pub fn supports(&self, desc: &OpDescriptor) -> bool {
        self.is_supported(&desc.name, desc)
    }

    /// Registered operator names in sorted order.
    pub fn registered_ops(&self) -> Vec<String> {
        self.predicates
            .read()
            .expect("op support registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates
            .read()
            .expect("op support registry lock poisoned")
            .is_empty()
    }
}

impl fmt::Debug for OpSupportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSupportRegistry")
            .field("ops", &self.registered_ops())
            .finish()
    }
}
