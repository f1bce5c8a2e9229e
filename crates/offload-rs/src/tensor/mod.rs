mod host_tensor;

pub use host_tensor::{HostTensor, TensorData, TensorError};
