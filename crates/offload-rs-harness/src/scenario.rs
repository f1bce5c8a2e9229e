use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use offload_rs::backend::builder::ProgramBuilder;
use offload_rs::backend::ir_utils::tensor_spec;
use offload_rs::backend::spec::{DType, Program};
use offload_rs::HostTensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::reference;
use crate::HarnessContext;

/// Single-operator programs with int32 inputs named `x` and `y`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    Add { shape: Vec<usize> },
    BiasAdd { xshape: Vec<usize>, yshape: Vec<usize>, axis: i64 },
}

impl Scenario {
    pub fn add(shape: &[usize]) -> Self {
        Scenario::Add {
            shape: shape.to_vec(),
        }
    }

    pub fn bias_add(xshape: &[usize], yshape: &[usize], axis: i64) -> Self {
        Scenario::BiasAdd {
            xshape: xshape.to_vec(),
            yshape: yshape.to_vec(),
            axis,
        }
    }

    /// Operator name as reported in scenario output.
    pub fn op_name(&self) -> &'static str {
        match self {
            Scenario::Add { .. } => "add",
            Scenario::BiasAdd { .. } => "nn.bias_add",
        }
    }

    fn shapes(&self) -> (&[usize], &[usize]) {
        match self {
            Scenario::Add { shape } => (shape.as_slice(), shape.as_slice()),
            Scenario::BiasAdd { xshape, yshape, .. } => (xshape.as_slice(), yshape.as_slice()),
        }
    }

    pub fn program(&self) -> Result<Program> {
        let (xshape, yshape) = self.shapes();
        let mut builder = ProgramBuilder::new();
        let x = builder.parameter("x", tensor_spec(DType::Si32, xshape))?;
        let y = builder.parameter("y", tensor_spec(DType::Si32, yshape))?;
        let z = match self {
            Scenario::Add { .. } => builder.add(x, y)?,
            Scenario::BiasAdd { axis, .. } => builder.bias_add(x, y, *axis)?,
        };
        Ok(builder.finish_program("main", vec![z])?)
    }

    pub fn inputs(&self, seed: u64, high: i32) -> Result<BTreeMap<String, HostTensor>> {
        let (xshape, yshape) = self.shapes();
        let mut rng = StdRng::seed_from_u64(seed);
        let x = HostTensor::randint(xshape.to_vec(), high, &mut rng)?;
        let y = HostTensor::randint(yshape.to_vec(), high, &mut rng)?;
        Ok(BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)]))
    }

    pub fn reference(&self, inputs: &BTreeMap<String, HostTensor>) -> Result<HostTensor> {
        let x = inputs.get("x").context("missing input 'x'")?;
        let y = inputs.get("y").context("missing input 'y'")?;
        match self {
            Scenario::Add { .. } => reference::add(x, y),
            Scenario::BiasAdd { axis, .. } => reference::bias_add(x, y, *axis),
        }
    }
}

/// A passed scenario and the cycles it took, if stats were available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    pub op: &'static str,
    pub lanes: u32,
    pub cycles: Option<u64>,
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cycles {
            Some(cycles) => write!(
                f,
                "test:{} vector-lanes:{} number of cycles:{}",
                self.op, self.lanes, cycles
            ),
            None => write!(
                f,
                "test:{} vector-lanes:{} number of cycles:unavailable",
                self.op, self.lanes
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioStatus {
    Passed(ScenarioOutcome),
    Skipped { reason: String },
}

/// Offloads, compiles and runs `scenario` with `lanes` vector lanes and checks it against
/// the reference. Skips when the configured backend is not registered.
pub fn run_scenario(cx: &HarnessContext, scenario: &Scenario, lanes: u32) -> Result<ScenarioStatus> {
    if !cx.backend_available() {
        let reason = format!("backend '{}' is not available", cx.config.backend);
        tracing::warn!(op = scenario.op_name(), %reason, "skipping scenario");
        return Ok(ScenarioStatus::Skipped { reason });
    }
    let program = cx.offload(&scenario.program()?)?;
    let exec = cx.compile(&program, lanes)?;
    let inputs = scenario.inputs(cx.config.seed, cx.config.input_high)?;
    let expected = scenario.reference(&inputs)?;
    let cycles = cx
        .run_and_check(&exec, &inputs, &[expected])
        .with_context(|| format!("scenario '{}' with {lanes} lanes", scenario.op_name()))?;
    Ok(ScenarioStatus::Passed(ScenarioOutcome {
        op: scenario.op_name(),
        lanes,
        cycles,
    }))
}

/// Expands to the standard scenario tests for a harness context constructor.
#[macro_export]
macro_rules! define_scenario_tests {
    ($module:ident, $context_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use super::*;

            use $crate::scenario::{run_scenario, Scenario, ScenarioStatus};

            macro_rules! scenario_test {
                ($name:ident, $scenario:expr, $lanes:expr) => {
                    #[test]
                    fn $name() {
                        let cx = ($context_ctor)();
                        match run_scenario(&cx, &$scenario, $lanes).expect("scenario") {
                            ScenarioStatus::Passed(outcome) => {
                                println!("{outcome}");
                                if let Some(cycles) = outcome.cycles {
                                    assert!(cycles > 0, "offloaded run reported no cycles");
                                }
                            }
                            ScenarioStatus::Skipped { reason } => {
                                println!("skipped: {reason}");
                            }
                        }
                    }
                };
            }

            scenario_test!(add_one_lane, Scenario::add(&[8, 4]), 1);
            scenario_test!(add_two_lanes, Scenario::add(&[8, 4]), 2);
            scenario_test!(
                bias_add_one_lane,
                Scenario::bias_add(&[1, 112, 112, 32], &[32], 3),
                1
            );
            scenario_test!(
                bias_add_thirty_two_lanes,
                Scenario::bias_add(&[1, 112, 112, 32], &[32], 3),
                32
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_line_matches_report_format() {
        let outcome = ScenarioOutcome {
            op: "add",
            lanes: 2,
            cycles: Some(16),
        };
        assert_eq!(outcome.to_string(), "test:add vector-lanes:2 number of cycles:16");
    }

    #[test]
    fn bias_reference_broadcasts_along_last_axis() {
        let scenario = Scenario::bias_add(&[1, 2, 2, 3], &[3], 3);
        let inputs = scenario.inputs(1, 5).expect("inputs");
        let out = scenario.reference(&inputs).expect("reference");
        let x = inputs["x"].as_i32().expect("x");
        let y = inputs["y"].as_i32().expect("y");
        let values = out.as_i32().expect("int32");
        for (k, v) in values.iter().enumerate() {
            assert_eq!(*v, x[k] + y[k % 3]);
        }
    }
}
