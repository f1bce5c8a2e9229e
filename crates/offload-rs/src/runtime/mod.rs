//! Execution of compiled executables.

pub mod kernels;
pub mod native;
pub mod vm;

pub use native::{NativeModule, NativeRuntime};
pub use vm::{Device, RunResult, VirtualMachine};
