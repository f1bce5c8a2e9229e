use offload_rs::backend::accelerator::{AcceleratorOptions, ExternalRuntime};
use offload_rs::backend::spec::{BackendError, BackendResult};
use offload_rs::profiling::SimProfiler;
use offload_rs::HostTensor;

use crate::codegen::{KernelKind, KernelPlan, KernelStep, Slot};
use crate::device::{VectorDevice, REG_LHS, REG_OUT, REG_RHS};

/// Drives a [`VectorDevice`] through a kernel plan.
pub struct VsimRuntime {
    plan: KernelPlan,
    device: Box<dyn VectorDevice>,
    options: AcceleratorOptions,
    profiler: SimProfiler,
}

impl VsimRuntime {
    pub fn new(
        plan: KernelPlan,
        device: Box<dyn VectorDevice>,
        options: AcceleratorOptions,
        profiler: SimProfiler,
    ) -> Self {
        Self {
            plan,
            device,
            options,
            profiler,
        }
    }

    pub fn lanes(&self) -> u32 {
        self.device.lanes()
    }

    /// Streams one kernel through the device in lane-sized chunks. The tail chunk is
    /// zero-padded. Returns the clock cycles spent.
    fn stream(&mut self, step: &KernelStep, lhs: &[i32], rhs: &[i32], out: &mut [i32]) -> u64 {
        let lanes = self.device.lanes().max(1) as usize;
        let rhs_at = |k: usize| match step.kind {
            KernelKind::Add => rhs[k],
            KernelKind::BiasAdd { inner, extent } => rhs[(k / inner.max(1)) % extent.max(1)],
        };
        let mut cycles = 0u64;
        for start in (0..step.elements).step_by(lanes) {
            let len = lanes.min(step.elements - start);
            for lane in 0..lanes {
                let (a, b) = if lane < len {
                    (lhs[start + lane], rhs_at(start + lane))
                } else {
                    (0, 0)
                };
                self.device.write(REG_LHS, lane as u32, a);
                self.device.write(REG_RHS, lane as u32, b);
            }
            self.device.run(1);
            cycles += 1;
            for lane in 0..len {
                out[start + lane] = self.device.read(REG_OUT, lane as u32);
            }
        }
        cycles
    }
}

fn int32_values(tensor: &HostTensor) -> BackendResult<Vec<i32>> {
    tensor
        .as_i32()
        .map(<[i32]>::to_vec)
        .ok_or_else(|| BackendError::execution(format!("vsim expects int32, got {}", tensor.dtype())))
}

fn fetch<'a>(
    slot: Slot,
    inputs: &'a [Vec<i32>],
    steps: &'a [Vec<i32>],
) -> BackendResult<&'a [i32]> {
    match slot {
        Slot::Input(index) => inputs.get(index),
        Slot::Step(index) => steps.get(index),
    }
    .map(Vec::as_slice)
    .ok_or_else(|| BackendError::execution(format!("{slot:?} is not available")))
}

impl ExternalRuntime for VsimRuntime {
    fn symbol(&self) -> &str {
        &self.plan.symbol
    }

    fn invoke(&mut self, inputs: &[HostTensor]) -> BackendResult<Vec<HostTensor>> {
        if inputs.len() != self.plan.inputs.len() {
            return Err(BackendError::execution(format!(
                "'{}' expects {} inputs, got {}",
                self.plan.symbol,
                self.plan.inputs.len(),
                inputs.len()
            )));
        }
        for (index, (tensor, spec)) in inputs.iter().zip(&self.plan.inputs).enumerate() {
            if tensor.spec() != *spec {
                return Err(BackendError::execution(format!(
                    "'{}' input {index} expects {spec}, got {}",
                    self.plan.symbol,
                    tensor.spec()
                )));
            }
        }
        let inputs = inputs
            .iter()
            .map(int32_values)
            .collect::<BackendResult<Vec<_>>>()?;

        self.device.reset(1);
        let steps_plan = self.plan.steps.clone();
        let mut results: Vec<Vec<i32>> = Vec::with_capacity(steps_plan.len());
        let mut cycles = 0u64;
        for step in &steps_plan {
            let lhs = fetch(step.lhs, &inputs, &results)?.to_vec();
            let rhs = fetch(step.rhs, &inputs, &results)?.to_vec();
            let rhs_len = match step.kind {
                KernelKind::Add => step.elements,
                KernelKind::BiasAdd { extent, .. } => extent,
            };
            if lhs.len() != step.elements || rhs.len() != rhs_len {
                return Err(BackendError::execution(format!(
                    "kernel expects {} and {rhs_len} elements, operands have {} and {}",
                    step.elements,
                    lhs.len(),
                    rhs.len()
                )));
            }
            let mut out = vec![0; step.elements];
            cycles += self.stream(step, &lhs, &rhs, &mut out);
            results.push(out);
        }

        if self.options.profiler_enable {
            self.profiler
                .record_cycles(self.options.profiler_cycle_counter_id, cycles);
            self.profiler.record_kernel(&self.plan.symbol);
        }
        tracing::debug!(
            symbol = %self.plan.symbol,
            lanes = self.device.lanes(),
            cycles,
            "vsim kernel finished"
        );

        let mut outputs = Vec::with_capacity(self.plan.outputs.len());
        for slot in &self.plan.outputs {
            let values = fetch(*slot, &inputs, &results)?.to_vec();
            let dims = match slot {
                Slot::Input(index) => self.plan.inputs[*index].shape.dims().to_vec(),
                Slot::Step(index) => self.plan.steps[*index].dims.clone(),
            };
            outputs.push(
                HostTensor::from_i32(dims, values)
                    .map_err(|err| BackendError::execution(err.to_string()))?,
            );
        }
        Ok(outputs)
    }
}
