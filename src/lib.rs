pub mod agent;
pub mod config;
pub mod csv_sample;
pub mod error;
pub mod execution;
pub mod model;
pub mod normalizer;
pub mod observability;
pub mod orchestrator;
pub mod segmenter;
pub mod server;

pub use error::{Result, SqllyError};
pub use orchestrator::{ConversionResponse, Orchestrator};
