//! Query execution against the remote endpoint, with the single type-mismatch repair.

pub mod endpoint;
pub mod error_classifier;
pub mod repair_loop;

pub use endpoint::*;
pub use error_classifier::*;
pub use repair_loop::*;
