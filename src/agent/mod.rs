//! Agent Request Client
//!
//! Sends a conversion request to the remote language-model agent and retries with
//! exponential backoff. HTTP sits behind [`AgentTransport`].

pub mod client;
pub mod transport;

pub use client::*;
pub use transport::*;
