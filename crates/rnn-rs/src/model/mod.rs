//! Prebuilt recurrent cell templates.

pub mod lstm;

pub use lstm::{LstmCell, LstmConfig};
