//! Execution of external modules through a compiled native shim.
//!
//! The ABI mirrors `include/offload/runtime.h`.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::backend::accelerator::{ExternalModule, ExternalRuntime};
use crate::backend::spec::{BackendError, BackendResult, DType, TensorSpec};
use crate::profiling::SimProfiler;
use crate::tensor::{HostTensor, TensorData};

#[repr(C)]
pub(crate) struct OffloadTensor {
    dtype: u32,
    rank: u32,
    dims: *const i64,
    data: *mut c_void,
}

pub(crate) type NativeEntrypoint =
    unsafe extern "C" fn(*const OffloadTensor, usize, *mut OffloadTensor, usize, *mut u64) -> i32;

fn dtype_tag(dtype: DType) -> u32 {
    match dtype {
        DType::Si32 => 0,
        DType::F32 => 1,
    }
}

fn dims_i64(dims: &[usize]) -> BackendResult<Vec<i64>> {
    dims.iter()
        .map(|&dim| {
            i64::try_from(dim).map_err(|_| BackendError::execution("dimension exceeds i64"))
        })
        .collect()
}

/// Loaded shared object exporting one entry point per module symbol.
pub struct NativeModule {
    path: PathBuf,
    lib: Library,
}

impl NativeModule {
    pub fn open(path: &Path) -> BackendResult<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|err| BackendError::execution(format!("{}: {err}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn entrypoint(&self, symbol: &str) -> BackendResult<NativeEntrypoint> {
        unsafe {
            self.lib
                .get::<NativeEntrypoint>(symbol.as_bytes())
                .map(|symbol| *symbol)
        }
        .map_err(|err| BackendError::execution(format!("symbol '{symbol}': {err}")))
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("path", &self.path)
            .finish()
    }
}

/// Runtime that calls a module's entry point inside a [`NativeModule`].
pub struct NativeRuntime {
    symbol: String,
    entry: NativeEntrypoint,
    outputs: Vec<TensorSpec>,
    profiler: Option<(SimProfiler, u32)>,
    _module: Arc<NativeModule>,
}

impl NativeRuntime {
    pub fn bind(
        module: Arc<NativeModule>,
        external: &ExternalModule,
        profiler: &SimProfiler,
    ) -> BackendResult<Self> {
        let entry = module.entrypoint(&external.symbol)?;
        let profiler = external
            .options
            .profiler_enable
            .then(|| (profiler.clone(), external.options.profiler_cycle_counter_id));
        Ok(Self {
            symbol: external.symbol.clone(),
            entry,
            outputs: external.outputs.clone(),
            profiler,
            _module: module,
        })
    }
}

impl ExternalRuntime for NativeRuntime {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn invoke(&mut self, inputs: &[HostTensor]) -> BackendResult<Vec<HostTensor>> {
        let input_dims = inputs
            .iter()
            .map(|tensor| dims_i64(tensor.dims()))
            .collect::<BackendResult<Vec<_>>>()?;
        let input_views = inputs
            .iter()
            .zip(&input_dims)
            .map(|(tensor, dims)| OffloadTensor {
                dtype: dtype_tag(tensor.dtype()),
                rank: dims.len() as u32,
                dims: dims.as_ptr(),
                data: match tensor.data() {
                    TensorData::Si32(values) => values.as_ptr() as *mut c_void,
                    TensorData::F32(values) => values.as_ptr() as *mut c_void,
                },
            })
            .collect::<Vec<_>>();

        let mut outputs = self
            .outputs
            .iter()
            .map(|spec| {
                HostTensor::zeros(spec).map_err(|err| BackendError::execution(err.to_string()))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let output_dims = outputs
            .iter()
            .map(|tensor| dims_i64(tensor.dims()))
            .collect::<BackendResult<Vec<_>>>()?;
        let mut output_views = outputs
            .iter_mut()
            .zip(&output_dims)
            .map(|(tensor, dims)| {
                let dtype = dtype_tag(tensor.dtype());
                let data = match tensor.data_mut() {
                    TensorData::Si32(values) => values.as_mut_ptr() as *mut c_void,
                    TensorData::F32(values) => values.as_mut_ptr() as *mut c_void,
                };
                OffloadTensor {
                    dtype,
                    rank: dims.len() as u32,
                    dims: dims.as_ptr(),
                    data,
                }
            })
            .collect::<Vec<_>>();

        let mut cycles = 0u64;
        let status = unsafe {
            (self.entry)(
                input_views.as_ptr(),
                input_views.len(),
                output_views.as_mut_ptr(),
                output_views.len(),
                &mut cycles,
            )
        };
        if status != 0 {
            return Err(BackendError::execution(format!(
                "native entry point '{}' returned status {status}",
                self.symbol
            )));
        }
        if let Some((profiler, counter)) = &self.profiler {
            profiler.record_cycles(*counter, cycles);
            profiler.record_kernel(&self.symbol);
        }
        tracing::debug!(symbol = %self.symbol, cycles, "native module finished");
        Ok(outputs)
    }
}
