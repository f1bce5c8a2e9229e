pub mod backend;
pub mod compiler;
pub mod env;
pub mod hardware;
pub mod profiling;
pub mod runtime;
pub mod stats;
pub mod tensor;
pub mod verify;

pub use backend::spec::{DType, Program, Shape, TensorSpec};
pub use tensor::HostTensor;
