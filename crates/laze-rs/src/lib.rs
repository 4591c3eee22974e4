pub mod backend;
pub mod device;
mod env;
pub mod executor;
pub mod ir;
pub mod metrics;
pub mod tensor;
pub mod trace;

pub use backend::spec::DeviceBackend;
pub use device::{Device, DeviceKind};
pub use executor::{CachePolicy, LazyGraphExecutor};
pub use tensor::{LazyTensor, LazyTensorOps};
