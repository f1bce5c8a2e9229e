//! Register-level protocol of the vector adder and its two implementations.
//!
//! The device exposes three register files addressed by lane: [`REG_LHS`], [`REG_RHS`]
//! and [`REG_OUT`]. One clock cycle adds every lane of the operand files into the output
//! file.

use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use offload_rs::backend::spec::{BackendError, BackendResult};

pub const REG_LHS: u32 = 0;
pub const REG_RHS: u32 = 1;
pub const REG_OUT: u32 = 2;

pub trait VectorDevice: Send {
    /// Holds reset high for `cycles` clock cycles.
    fn reset(&mut self, cycles: u32);
    fn write(&mut self, id: u32, addr: u32, value: i32);
    fn read(&mut self, id: u32, addr: u32) -> i32;
    /// Advances the clock by `cycles`.
    fn run(&mut self, cycles: u32);
    fn lanes(&self) -> u32;
}

/// In-process model of the adder.
#[derive(Debug, Clone)]
pub struct SoftwareDevice {
    lanes: u32,
    files: [Vec<i32>; 3],
    elapsed: u64,
}

impl SoftwareDevice {
    pub fn new(lanes: u32) -> Self {
        let lanes = lanes.max(1);
        let file = vec![0; lanes as usize];
        Self {
            lanes,
            files: [file.clone(), file.clone(), file],
            elapsed: 0,
        }
    }

    /// Clock cycles since the last reset.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    fn slot(&mut self, id: u32, addr: u32) -> Option<&mut i32> {
        self.files
            .get_mut(id as usize)
            .and_then(|file| file.get_mut(addr as usize))
    }
}

impl VectorDevice for SoftwareDevice {
    fn reset(&mut self, _cycles: u32) {
        for file in &mut self.files {
            file.iter_mut().for_each(|value| *value = 0);
        }
        self.elapsed = 0;
    }

    fn write(&mut self, id: u32, addr: u32, value: i32) {
        if id == REG_OUT {
            return;
        }
        if let Some(slot) = self.slot(id, addr) {
            *slot = value;
        }
    }

    fn read(&mut self, id: u32, addr: u32) -> i32 {
        self.slot(id, addr).map_or(0, |slot| *slot)
    }

    fn run(&mut self, cycles: u32) {
        for _ in 0..cycles {
            let [lhs, rhs, out] = &mut self.files;
            for ((o, a), b) in out.iter_mut().zip(lhs.iter()).zip(rhs.iter()) {
                *o = a.wrapping_add(*b);
            }
            self.elapsed += 1;
        }
    }

    fn lanes(&self) -> u32 {
        self.lanes
    }
}

type AllocFn = unsafe extern "C" fn() -> *mut c_void;
type DeallocFn = unsafe extern "C" fn(*mut c_void);
type ResetFn = unsafe extern "C" fn(*mut c_void, i32);
type WriteFn = unsafe extern "C" fn(*mut c_void, i32, i32, i32);
type ReadFn = unsafe extern "C" fn(*mut c_void, i32, i32) -> i32;
type RunFn = unsafe extern "C" fn(*mut c_void, i32);
type LanesFn = unsafe extern "C" fn(*mut c_void) -> i32;

struct DeviceApi {
    alloc: AllocFn,
    dealloc: DeallocFn,
    reset: ResetFn,
    write: WriteFn,
    read: ReadFn,
    run: RunFn,
    lanes: LanesFn,
    _lib: Arc<Library>,
}

fn symbol<T: Copy>(lib: &Library, name: &str) -> BackendResult<T> {
    unsafe { lib.get::<T>(name.as_bytes()).map(|symbol| *symbol) }
        .map_err(|err| BackendError::execution(format!("simulator symbol '{name}': {err}")))
}

impl DeviceApi {
    fn load(path: &Path) -> BackendResult<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|err| BackendError::execution(format!("{}: {err}", path.display())))?;
        Ok(Self {
            alloc: symbol(&lib, "vsim_alloc")?,
            dealloc: symbol(&lib, "vsim_dealloc")?,
            reset: symbol(&lib, "vsim_reset")?,
            write: symbol(&lib, "vsim_write")?,
            read: symbol(&lib, "vsim_read")?,
            run: symbol(&lib, "vsim_run")?,
            lanes: symbol(&lib, "vsim_lanes")?,
            _lib: Arc::new(lib),
        })
    }
}

/// Device backed by a simulator shared object exporting the `vsim_*` C ABI.
pub struct SharedObjectDevice {
    api: DeviceApi,
    handle: *mut c_void,
    lanes: u32,
}

// SAFETY: the handle is owned exclusively by this value and only touched through
// `&mut self`, so moving it to another thread is sound.
unsafe impl Send for SharedObjectDevice {}

impl SharedObjectDevice {
    pub fn open(path: &Path) -> BackendResult<Self> {
        let api = DeviceApi::load(path)?;
        let handle = unsafe { (api.alloc)() };
        if handle.is_null() {
            return Err(BackendError::execution(format!(
                "{}: vsim_alloc returned null",
                path.display()
            )));
        }
        let lanes = unsafe { (api.lanes)(handle) };
        let lanes = match u32::try_from(lanes) {
            Ok(lanes) if lanes > 0 => lanes,
            _ => {
                unsafe { (api.dealloc)(handle) };
                return Err(BackendError::execution(format!(
                    "{}: device reports {lanes} lanes",
                    path.display()
                )));
            }
        };
        tracing::debug!(path = %path.display(), lanes, "opened simulator library");
        Ok(Self { api, handle, lanes })
    }
}

fn c_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl VectorDevice for SharedObjectDevice {
    fn reset(&mut self, cycles: u32) {
        unsafe { (self.api.reset)(self.handle, c_int(cycles)) }
    }

    fn write(&mut self, id: u32, addr: u32, value: i32) {
        unsafe { (self.api.write)(self.handle, c_int(id), c_int(addr), value) }
    }

    fn read(&mut self, id: u32, addr: u32) -> i32 {
        unsafe { (self.api.read)(self.handle, c_int(id), c_int(addr)) }
    }

    fn run(&mut self, cycles: u32) {
        unsafe { (self.api.run)(self.handle, c_int(cycles)) }
    }

    fn lanes(&self) -> u32 {
        self.lanes
    }
}

impl Drop for SharedObjectDevice {
    fn drop(&mut self) {
        unsafe { (self.api.dealloc)(self.handle) }
    }
}
