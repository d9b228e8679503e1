//! Cross-clone memory optimization for unrolled recurrent networks.
//!
//! Recurrent training unrolls one template graph into T parameter-shared
//! clones, and a naive rendition allocates every intermediate tensor of every
//! clone separately. This crate calibrates the unrolled computation once,
//! derives live intervals for every buffer from the recorded trace, packs
//! instances with disjoint lifetimes into shared slots, and rewrites the
//! clones' storage in place. Parameters, feeds, initial recurrent states, and
//! exported outputs keep dedicated buffers.
//!
//! The entry point is [`memory::optimize`]; [`model::LstmCell`] builds the
//! stacked-LSTM template most callers unroll.

pub mod error;
pub mod exec;
pub mod graph;
pub mod hashing;
pub mod memory;
pub mod model;
pub mod ops;
pub mod profiling;
pub mod tensor;

pub use error::OptimizerError;
pub use memory::{optimize, SharingReport};
pub use tensor::{DType, Shape, Tensor};
