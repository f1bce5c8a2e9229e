//! Compilation of partitioned programs into VM executables.
//!
//! External functions go through their backend's codegen; the entry function is lowered
//! into register bytecode. Backend options are read from the current
//! [`PassContext`](crate::backend::pass_context::PassContext).

mod executable;
mod export;
mod lower;

use std::io;

use thiserror::Error;

use crate::backend::accelerator::AcceleratorOptions;
use crate::backend::pass_context::{accelerator_options_key, with_pass_context, PassContext};
use crate::backend::spec::{BackendError, Program};
use crate::backend::validate::ValidationError;

pub use executable::{
    Bytecode, Executable, ExecutableCode, ExternalLibrary, HostOp, InputSlot, Reg,
    BYTECODE_VERSION,
};
pub use export::{export_library, lib_ext, load_module, runtime_include_dir, ExportOptions};
pub use lower::Compiler;

/// Optimization level used for accelerator compiles.
pub const ACCELERATOR_OPT_LEVEL: u8 = 3;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("function '{function}' targets backend '{backend}', which is not registered")]
    UnknownBackend { function: String, backend: String },
    #[error("codegen for '{symbol}' failed: {source}")]
    Codegen {
        symbol: String,
        #[source]
        source: BackendError,
    },
    #[error("options for backend '{backend}' are malformed: {source}")]
    Options {
        backend: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot lower program: {0}")]
    Unsupported(String),
    #[error("invalid executable: {0}")]
    Invalid(String),
    #[error("executable version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("native shim: {0}")]
    Native(String),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Compiles `program` with `options` installed for `backend`.
///
/// The options live in a pass context that is popped when this returns, whether the
/// compile succeeded or not.
pub fn compile_with_options(
    compiler: &Compiler<'_>,
    program: &Program,
    backend: &str,
    options: &AcceleratorOptions,
) -> Result<Executable, CompileError> {
    let mut cx = PassContext::current();
    cx.opt_level = ACCELERATOR_OPT_LEVEL;
    let cx = cx
        .with_typed_config(accelerator_options_key(backend), options)
        .map_err(|source| CompileError::Options {
            backend: backend.to_string(),
            source,
        })?;
    with_pass_context(cx, || compiler.compile(program))
}
