//! Core tensor abstractions shared across the graph, executor, and optimizer.
//!
//! The tensor module defines logical shapes, scalar dtypes, the shared
//! `Storage` buffer that buffer slots and tensor instances alias into, and a
//! simple host tensor used for feeds and test assertions.

pub mod dtype;
mod host_tensor;
pub mod shape;
pub mod storage;

pub use dtype::DType;
pub use host_tensor::Tensor;
pub use shape::Shape;
pub use storage::Storage;
