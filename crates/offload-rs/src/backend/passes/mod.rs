//! Program-level passes that place operators on accelerator backends.
//!
//! Passes never mutate their input: each takes `&Program` and returns a rewritten copy.

mod annotate;
mod partition;

use thiserror::Error;

use crate::backend::spec::Program;
use crate::backend::validate::ValidationError;

pub use annotate::AnnotateTarget;
pub use partition::PartitionGraph;

/// Result returned by a [`ProgramPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of rewrite iterations executed while applying the pass.
    pub iterations: usize,
    /// Total number of rewrites applied by the pass.
    pub rewrites_applied: usize,
    /// Instructions removed from their original function.
    pub erased_insts: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_insts: self.erased_insts + other.erased_insts,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PassError {
    #[error("function '{function}': instruction %{id} has no target; run annotation first")]
    Unannotated { function: String, id: u32 },
    #[error("function '{function}': {detail}")]
    Unsupported { function: String, detail: String },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Whole-program rewrite.
pub trait ProgramPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, program: &Program) -> Result<(Program, PassResult), PassError>;
}

/// Runs `passes` in order, threading each output into the next pass.
pub fn run_passes(
    program: &Program,
    passes: &[&dyn ProgramPass],
) -> Result<(Program, PassResult), PassError> {
    let mut current = program.clone();
    let mut total = PassResult::default();
    for pass in passes {
        let (next, result) = pass.run(&current)?;
        tracing::debug!(
            pass = pass.name(),
            changed = result.changed,
            rewrites = result.rewrites_applied,
            erased = result.erased_insts,
            "pass finished"
        );
        current = next;
        total = total.merge(PassResult {
            iterations: 1,
            ..result
        });
    }
    Ok((current, total))
}
