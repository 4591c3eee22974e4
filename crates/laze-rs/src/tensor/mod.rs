//! Tensor frontend: shared payloads and the user-facing lazy wrapper.
//!
//! [`TensorData`] is the unit the executor tracks and materializes;
//! [`LazyTensor`] is the handle user code holds. [`LazyTensorOps`] is
//! re-exported here so the math helpers live next to the tensor types they
//! extend.

mod data;
mod lazy;
mod ops;

pub use data::{TensorData, TensorState};
pub use lazy::LazyTensor;
pub use ops::LazyTensorOps;
