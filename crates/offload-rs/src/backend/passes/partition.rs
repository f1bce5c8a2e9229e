use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::backend::builder::ProgramBuilder;
use crate::backend::passes::{PassError, PassResult, ProgramPass};
use crate::backend::spec::{
    ExternalCallSpec, Function, Operand, Operation, Program, Target, ValueId, ValueType,
};
use crate::backend::validate::validate_program;

/// Splits annotated functions into host code plus one external function per accelerator
/// region.
///
/// Regions grow in body order. A node joins the regions of its accelerator producers
/// only when no path leaves the merged region and re-enters it, either through host
/// nodes or through another region. Accelerator nodes whose value is never read stay on
/// the host.
#[derive(Debug, Clone, Copy)]
pub struct PartitionGraph {
    merge_regions: bool,
}

impl Default for PartitionGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionGraph {
    const NAME: &'static str = "partition_graph";

    /// Merges connected accelerator nodes into shared regions.
    pub fn new() -> Self {
        Self {
            merge_regions: true,
        }
    }

    /// Wraps every accelerator node in its own region.
    pub fn per_operator() -> Self {
        Self {
            merge_regions: false,
        }
    }
}

#[derive(Clone)]
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    /// Joins two sets; the smaller index becomes the root.
    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[hi] = lo;
    }
}

struct RegionNamer {
    taken: HashSet<String>,
    next: HashMap<String, usize>,
}

impl RegionNamer {
    fn new(program: &Program) -> Self {
        Self {
            taken: program
                .functions
                .iter()
                .map(|function| function.name.clone())
                .collect(),
            next: HashMap::new(),
        }
    }

    fn next_name(&mut self, backend: &str) -> String {
        let counter = self.next.entry(backend.to_string()).or_insert(0);
        loop {
            let candidate = format!("{backend}_{counter}");
            *counter += 1;
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

fn unsupported(function: &Function, detail: impl Into<String>) -> PassError {
    PassError::Unsupported {
        function: function.name.clone(),
        detail: detail.into(),
    }
}

fn unit_assignment(sets: &mut UnionFind, backends: &[Option<&str>], len: usize) -> Vec<usize> {
    (0..len)
        .map(|node| {
            if backends[node].is_some() {
                sets.find(node)
            } else {
                node
            }
        })
        .collect()
}

fn units_are_acyclic(
    sets: &mut UnionFind,
    backends: &[Option<&str>],
    producers: &[Vec<usize>],
) -> bool {
    let unit_of = unit_assignment(sets, backends, producers.len());
    schedule_units(&unit_of, producers).is_some()
}

fn remap_operand(
    function: &Function,
    operand: &Operand,
    remap: &HashMap<ValueId, Operand>,
) -> Result<Operand, PassError> {
    match operand {
        Operand::Literal(_) => Ok(operand.clone()),
        Operand::Value(id) => remap
            .get(id)
            .cloned()
            .ok_or_else(|| unsupported(function, format!("%{} has no rewritten value", id.0))),
        Operand::TupleElement { tuple, index } => match remap.get(tuple) {
            Some(Operand::Value(new_tuple)) => Ok(Operand::TupleElement {
                tuple: *new_tuple,
                index: *index,
            }),
            _ => Err(unsupported(
                function,
                format!("%{}.{} cannot be rewritten", tuple.0, index),
            )),
        },
    }
}

fn operand_type(
    function: &Function,
    operand: &Operand,
    types: &HashMap<ValueId, ValueType>,
) -> Result<ValueType, PassError> {
    match operand {
        Operand::Value(id) => types
            .get(id)
            .cloned()
            .ok_or_else(|| unsupported(function, format!("%{} has no type", id.0))),
        Operand::TupleElement { tuple, index } => match types.get(tuple) {
            Some(ValueType::Tuple(elements)) => elements.get(*index).cloned().ok_or_else(|| {
                unsupported(function, format!("%{}.{} is out of range", tuple.0, index))
            }),
            _ => Err(unsupported(function, format!("%{} is not a tuple", tuple.0))),
        },
        Operand::Literal(literal) => Ok(ValueType::Tensor(literal.spec.clone())),
    }
}

struct FunctionPartition {
    host: Function,
    regions: Vec<Function>,
    result: PassResult,
}

impl PartitionGraph {
    /// Assigns accelerator nodes to regions. Host nodes stay singletons.
    ///
    /// A merge is kept only while the graph of regions and host nodes stays acyclic.
    fn group(&self, backends: &[Option<&str>], producers: &[Vec<usize>]) -> UnionFind {
        let len = backends.len();
        let mut sets = UnionFind::new(len);
        if !self.merge_regions {
            return sets;
        }
        for node in 0..len {
            let Some(backend) = backends[node] else {
                continue;
            };
            let mut candidates = producers[node]
                .iter()
                .filter(|&&producer| backends[producer] == Some(backend))
                .map(|&producer| sets.find(producer))
                .collect::<Vec<_>>();
            candidates.sort_unstable();
            candidates.dedup();

            for root in candidates {
                let mut trial = sets.clone();
                trial.union(root, node);
                if units_are_acyclic(&mut trial, backends, &producers[..=node]) {
                    sets = trial;
                } else {
                    tracing::debug!(
                        node,
                        region_root = root,
                        "region merge rejected: regions would depend on each other"
                    );
                }
            }
        }
        sets
    }

    fn partition_function(
        &self,
        function: &Function,
        namer: &mut RegionNamer,
    ) -> Result<FunctionPartition, PassError> {
        let body = &function.body;
        let mut backends: Vec<Option<&str>> = Vec::with_capacity(body.len());
        for instruction in body {
            match &instruction.target {
                None => {
                    return Err(PassError::Unannotated {
                        function: function.name.clone(),
                        id: instruction.id.0,
                    })
                }
                Some(Target::Host) => backends.push(None),
                Some(Target::External(name)) => backends.push(Some(name.as_str())),
            }
        }

        let live: HashSet<ValueId> = body
            .iter()
            .flat_map(|instruction| instruction.operands.iter().filter_map(Operand::value_id))
            .chain(function.result_ids.iter().copied())
            .collect();
        for (backend, instruction) in backends.iter_mut().zip(body) {
            if backend.is_some() && !live.contains(&instruction.id) {
                tracing::debug!(id = instruction.id.0, "unused accelerator value stays on host");
                *backend = None;
            }
        }

        if backends.iter().all(Option::is_none) {
            let mut host = function.clone();
            for instruction in &mut host.body {
                instruction.target = None;
            }
            return Ok(FunctionPartition {
                host,
                regions: Vec::new(),
                result: PassResult::default(),
            });
        }

        let index_of: HashMap<ValueId, usize> = body
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.id, index))
            .collect();
        let producers: Vec<Vec<usize>> = body
            .iter()
            .map(|instruction| {
                let mut deps = instruction
                    .operands
                    .iter()
                    .filter_map(Operand::value_id)
                    .filter_map(|id| index_of.get(&id).copied())
                    .collect::<Vec<_>>();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        let mut sets = self.group(&backends, &producers);
        let unit_of = unit_assignment(&mut sets, &backends, body.len());
        let mut regions: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (node, backend) in backends.iter().enumerate() {
            if backend.is_some() {
                regions.entry(unit_of[node]).or_default().push(node);
            }
        }

        let order = schedule_units(&unit_of, &producers)
            .ok_or_else(|| unsupported(function, "partitioned regions form a cycle"))?;

        let mut types: HashMap<ValueId, ValueType> = function
            .parameter_ids
            .iter()
            .copied()
            .zip(function.parameters.iter().cloned())
            .collect();
        for instruction in body {
            types.insert(instruction.id, instruction.output.clone());
        }
        let mut consumers: HashMap<ValueId, Vec<usize>> = HashMap::new();
        for (index, instruction) in body.iter().enumerate() {
            for id in instruction.operands.iter().filter_map(Operand::value_id) {
                consumers.entry(id).or_default().push(index);
            }
        }
        let results: HashSet<ValueId> = function.result_ids.iter().copied().collect();

        let mut builder = ProgramBuilder::new();
        let mut remap: HashMap<ValueId, Operand> = HashMap::new();
        for (index, (id, ty)) in function
            .parameter_ids
            .iter()
            .zip(function.parameters.iter())
            .enumerate()
        {
            let new_id = builder.add_parameter(function.parameter_name(index), ty.clone());
            remap.insert(*id, Operand::Value(new_id));
        }

        let mut extracted = Vec::with_capacity(regions.len());
        for unit in order {
            let Some(members) = regions.get(&unit) else {
                let instruction = &body[unit];
                let operands = instruction
                    .operands
                    .iter()
                    .map(|operand| remap_operand(function, operand, &remap))
                    .collect::<Result<Vec<_>, _>>()?;
                let new_id = builder.emit_single(
                    instruction.op.clone(),
                    operands,
                    instruction.output.clone(),
                );
                remap.insert(instruction.id, Operand::Value(new_id));
                continue;
            };

            let backend = backends[unit].unwrap_or_default();
            let member_set: HashSet<usize> = members.iter().copied().collect();
            let member_ids: HashSet<ValueId> =
                members.iter().map(|&member| body[member].id).collect();

            let mut inputs: Vec<Operand> = Vec::new();
            for &member in members {
                for operand in &body[member].operands {
                    if matches!(operand, Operand::Literal(_)) {
                        continue;
                    }
                    if operand
                        .value_id()
                        .is_some_and(|id| member_ids.contains(&id))
                    {
                        continue;
                    }
                    if !inputs.contains(operand) {
                        inputs.push(operand.clone());
                    }
                }
            }
            let outputs: Vec<ValueId> = members
                .iter()
                .map(|&member| body[member].id)
                .filter(|id| {
                    results.contains(id)
                        || consumers.get(id).is_some_and(|users| {
                            users.iter().any(|user| !member_set.contains(user))
                        })
                })
                .collect();

            let name = namer.next_name(backend);
            let mut inner = ProgramBuilder::new();
            let mut input_params: Vec<(Operand, ValueId)> = Vec::with_capacity(inputs.len());
            for (index, input) in inputs.iter().enumerate() {
                let ty = operand_type(function, input, &types)?;
                let param = inner.add_parameter(format!("in{index}"), ty);
                input_params.push((input.clone(), param));
            }
            let mut inner_ids: HashMap<ValueId, ValueId> = HashMap::new();
            for &member in members {
                let instruction = &body[member];
                let mut operands = Vec::with_capacity(instruction.operands.len());
                for operand in &instruction.operands {
                    let mapped = match operand {
                        Operand::Literal(_) => operand.clone(),
                        Operand::Value(id) if inner_ids.contains_key(id) => {
                            Operand::Value(inner_ids[id])
                        }
                        Operand::TupleElement { tuple, index } if inner_ids.contains_key(tuple) => {
                            Operand::TupleElement {
                                tuple: inner_ids[tuple],
                                index: *index,
                            }
                        }
                        _ => input_params
                            .iter()
                            .find(|(input, _)| input == operand)
                            .map(|(_, param)| Operand::Value(*param))
                            .ok_or_else(|| {
                                unsupported(function, "region operand is neither input nor member")
                            })?,
                    };
                    operands.push(mapped);
                }
                let new_id =
                    inner.emit_single(instruction.op.clone(), operands, instruction.output.clone());
                inner_ids.insert(instruction.id, new_id);
            }
            let region_results = outputs.iter().map(|id| inner_ids[id]).collect::<Vec<_>>();
            let mut region = inner
                .finish(name.clone(), region_results)
                .map_err(|err| unsupported(function, err.to_string()))?;
            region.compiler = Some(backend.to_string());

            let call_operands = inputs
                .iter()
                .map(|operand| remap_operand(function, operand, &remap))
                .collect::<Result<Vec<_>, _>>()?;
            let output_type = match outputs.as_slice() {
                [single] => types[single].clone(),
                many => ValueType::Tuple(many.iter().map(|id| types[id].clone()).collect()),
            };
            let call = builder.emit_single(
                Operation::ExternalCall(ExternalCallSpec {
                    compiler: backend.to_string(),
                    symbol: name.clone(),
                    function: name.clone(),
                }),
                call_operands,
                output_type,
            );
            if let [single] = outputs.as_slice() {
                remap.insert(*single, Operand::Value(call));
            } else {
                for (index, id) in outputs.iter().enumerate() {
                    remap.insert(*id, Operand::TupleElement { tuple: call, index });
                }
            }
            tracing::debug!(
                region = %name,
                backend,
                nodes = members.len(),
                inputs = inputs.len(),
                outputs = outputs.len(),
                "extracted region"
            );
            extracted.push(region);
        }

        let mut result_ids = Vec::with_capacity(function.result_ids.len());
        for id in &function.result_ids {
            match remap.get(id) {
                Some(Operand::Value(new_id)) => result_ids.push(*new_id),
                Some(Operand::TupleElement { tuple, index }) => {
                    let projected = builder.emit_single(
                        Operation::TupleGet { index: *index },
                        vec![Operand::Value(*tuple)],
                        types[id].clone(),
                    );
                    result_ids.push(projected);
                }
                _ => return Err(unsupported(function, format!("result %{} is lost", id.0))),
            }
        }
        let host = builder
            .finish(function.name.clone(), result_ids)
            .map_err(|err| unsupported(function, err.to_string()))?;

        let offloaded = backends.iter().filter(|backend| backend.is_some()).count();
        Ok(FunctionPartition {
            host,
            result: PassResult {
                changed: true,
                iterations: 0,
                rewrites_applied: extracted.len(),
                erased_insts: offloaded,
            },
            regions: extracted,
        })
    }
}

/// Topologically orders units (host nodes and region roots) by their smallest node index.
fn schedule_units(unit_of: &[usize], producers: &[Vec<usize>]) -> Option<Vec<usize>> {
    let units: BTreeSet<usize> = unit_of.iter().copied().collect();
    let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    let mut indegree: BTreeMap<usize, usize> = units.iter().map(|&unit| (unit, 0)).collect();
    for (node, deps) in producers.iter().enumerate() {
        let to = unit_of[node];
        for &dep in deps {
            let from = unit_of[dep];
            if from != to && edges.entry(from).or_default().insert(to) {
                *indegree.entry(to).or_insert(0) += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&unit, _)| Reverse(unit))
        .collect();
    let mut order = Vec::with_capacity(units.len());
    while let Some(Reverse(unit)) = ready.pop() {
        order.push(unit);
        if let Some(next) = edges.get(&unit) {
            for &succ in next {
                if let Some(count) = indegree.get_mut(&succ) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(succ));
                    }
                }
            }
        }
    }
    (order.len() == units.len()).then_some(order)
}

impl ProgramPass for PartitionGraph {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, program: &Program) -> Result<(Program, PassResult), PassError> {
        validate_program(program)?;
        let mut namer = RegionNamer::new(program);
        let mut functions = Vec::with_capacity(program.functions.len());
        let mut regions = Vec::new();
        let mut total = PassResult::default();
        for function in &program.functions {
            if function.is_external() {
                functions.push(function.clone());
                continue;
            }
            let partition = self.partition_function(function, &mut namer)?;
            total = total.merge(partition.result);
            functions.push(partition.host);
            regions.extend(partition.regions);
        }
        functions.extend(regions);
        tracing::debug!(
            regions = total.rewrites_applied,
            offloaded = total.erased_insts,
            merge_regions = self.merge_regions,
            "partition complete"
        );
        Ok((
            Program {
                spec_version: program.spec_version.clone(),
                entry: program.entry.clone(),
                functions,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::ir_utils::tensor_spec;
    use crate::backend::op_support::OpSupportRegistry;
    use crate::backend::passes::AnnotateTarget;
    use crate::backend::spec::{DType, ElementwiseBinaryOp, ElementwiseUnaryOp};

    fn annotate(program: &Program, ops: &[&str]) -> Program {
        let registry = Arc::new(OpSupportRegistry::new());
        for op in ops {
            registry.register_supported(*op, true);
        }
        AnnotateTarget::new(registry, "vsim")
            .run(program)
            .expect("annotate")
            .0
    }

    fn external_calls(function: &Function) -> Vec<String> {
        function
            .body
            .iter()
            .filter_map(|inst| match &inst.op {
                Operation::ExternalCall(spec) => Some(spec.symbol.clone()),
                _ => None,
            })
            .collect()
    }

    fn chain() -> Program {
        let spec = tensor_spec(DType::Si32, &[8, 4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        let a = builder.add(x, y).expect("a");
        let b = builder.add(a, y).expect("b");
        builder.finish_program("main", vec![b]).expect("program")
    }

    #[test]
    fn single_add_becomes_one_external_call() {
        let spec = tensor_spec(DType::Si32, &[8, 4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        let z = builder.add(x, y).expect("add");
        let program = builder.finish_program("main", vec![z]).expect("program");

        let (partitioned, result) = PartitionGraph::new()
            .run(&annotate(&program, &["add"]))
            .expect("partition");
        assert_eq!(result.rewrites_applied, 1);
        let main = partitioned.entry_function().expect("main");
        assert_eq!(external_calls(main), vec!["vsim_0".to_string()]);
        assert_eq!(main.parameter_names, vec!["x", "y"]);
        let region = partitioned.function("vsim_0").expect("region");
        assert_eq!(region.compiler.as_deref(), Some("vsim"));
        assert_eq!(region.body.len(), 1);
        assert_eq!(region.parameters.len(), 2);
        assert!(validate_program(&partitioned).is_ok());
    }

    #[test]
    fn nothing_supported_leaves_program_unchanged() {
        let program = chain();
        let (partitioned, result) = PartitionGraph::new()
            .run(&annotate(&program, &[]))
            .expect("partition");
        assert_eq!(partitioned, program);
        assert!(!result.changed);
    }

    #[test]
    fn merging_and_per_operator_modes_differ() {
        let annotated = annotate(&chain(), &["add"]);
        let (merged, _) = PartitionGraph::new().run(&annotated).expect("merged");
        assert_eq!(merged.external_functions().count(), 1);
        let (split, _) = PartitionGraph::per_operator().run(&annotated).expect("split");
        assert_eq!(split.external_functions().count(), 2);
        assert_eq!(
            external_calls(split.entry_function().expect("main")),
            vec!["vsim_0".to_string(), "vsim_1".to_string()]
        );
    }

    #[test]
    fn host_detour_prevents_cyclic_region() {
        let spec = tensor_spec(DType::Si32, &[4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        let a = builder.add(x, y).expect("a");
        let h = builder.unary(ElementwiseUnaryOp::Neg, a).expect("h");
        let c = builder.add(a, h).expect("c");
        let program = builder.finish_program("main", vec![c]).expect("program");

        let (partitioned, _) = PartitionGraph::new()
            .run(&annotate(&program, &["add"]))
            .expect("partition");
        assert_eq!(partitioned.external_functions().count(), 2);
        assert!(validate_program(&partitioned).is_ok());
    }

    #[test]
    fn regions_do_not_wait_on_each_other_through_host_code() {
        let spec = tensor_spec(DType::Si32, &[4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        let a = builder.add(x, x).expect("a");
        let b = builder.add(y, y).expect("b");
        let h1 = builder.unary(ElementwiseUnaryOp::Neg, a).expect("h1");
        let c = builder.add(b, h1).expect("c");
        let h2 = builder.unary(ElementwiseUnaryOp::Neg, b).expect("h2");
        let d = builder.add(a, h2).expect("d");
        let program = builder.finish_program("main", vec![c, d]).expect("program");

        let (partitioned, result) = PartitionGraph::new()
            .run(&annotate(&program, &["add"]))
            .expect("partition");
        assert_eq!(result.erased_insts, 4);
        assert_eq!(partitioned.external_functions().count(), 3);
        let sizes = partitioned
            .external_functions()
            .map(|region| region.body.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![1, 2, 1]);
        assert!(validate_program(&partitioned).is_ok());
    }

    #[test]
    fn unused_accelerator_value_stays_on_host() {
        let spec = tensor_spec(DType::Si32, &[4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        builder.add(x, y).expect("unused");
        let live = builder.add(x, x).expect("live");
        let program = builder.finish_program("main", vec![live]).expect("program");

        let (partitioned, result) = PartitionGraph::new()
            .run(&annotate(&program, &["add"]))
            .expect("partition");
        assert_eq!(result.erased_insts, 1);
        assert_eq!(partitioned.external_functions().count(), 1);
        let main = partitioned.entry_function().expect("main");
        assert!(main
            .body
            .iter()
            .any(|inst| matches!(inst.op, Operation::ElementwiseBinary(ElementwiseBinaryOp::Add))));
        assert!(validate_program(&partitioned).is_ok());
    }

    #[test]
    fn only_unused_accelerator_values_means_no_regions() {
        let spec = tensor_spec(DType::Si32, &[4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec).expect("x");
        builder.add(x, x).expect("unused");
        let h = builder.unary(ElementwiseUnaryOp::Neg, x).expect("h");
        let program = builder.finish_program("main", vec![h]).expect("program");

        let (partitioned, result) = PartitionGraph::new()
            .run(&annotate(&program, &["add"]))
            .expect("partition");
        assert_eq!(partitioned.external_functions().count(), 0);
        assert!(!result.changed);
    }

    #[test]
    fn multi_output_region_is_consumed_through_tuple_elements() {
        let spec = tensor_spec(DType::Si32, &[4]);
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", spec.clone()).expect("x");
        let y = builder.parameter("y", spec).expect("y");
        let a = builder.add(x, y).expect("a");
        let b = builder
            .binary(ElementwiseBinaryOp::Add, a, x)
            .expect("b");
        let h = builder.unary(ElementwiseUnaryOp::Neg, a).expect("h");
        let program = builder.finish_program("main", vec![h, b]).expect("program");

        let (partitioned, _) = PartitionGraph::new()
            .run(&annotate(&program, &["add"]))
            .expect("partition");
        let region = partitioned.function("vsim_0").expect("region");
        assert_eq!(region.result_ids.len(), 2);
        let main = partitioned.entry_function().expect("main");
        assert!(main.body.iter().any(|inst| inst
            .operands
            .iter()
            .any(|operand| matches!(operand, Operand::TupleElement { index: 0, .. }))));
        assert!(main
            .body
            .iter()
            .any(|inst| matches!(inst.op, Operation::TupleGet { index: 1 })));
        assert!(validate_program(&partitioned).is_ok());
    }

    #[test]
    fn unannotated_input_is_rejected() {
        let err = PartitionGraph::new().run(&chain()).expect_err("unannotated");
        assert!(matches!(err, PassError::Unannotated { .. }));
    }

    #[test]
    fn partition_is_deterministic() {
        let annotated = annotate(&chain(), &["add"]);
        let first = PartitionGraph::new().run(&annotated).expect("first").0;
        let second = PartitionGraph::new().run(&annotated).expect("second").0;
        assert_eq!(first, second);
    }
}
