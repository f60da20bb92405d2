//! Error Classifier
//!
//! Classifies query-endpoint errors for recovery. Only the wire-type mismatch between
//! the stored `jsonb` document and the procedure's declared `json` result is recoverable.

use crate::error::EndpointError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Substrings that identify a wire-type mismatch, matched case-insensitively against
/// the error's message and details.
pub const TYPE_MISMATCH_SIGNATURES: &[&str] = &[
    "type jsonb does not match expected type json",
    "structure of query does not match function result type",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorClass {
    TypeMismatch,
    Other,
}

impl fmt::Display for WireErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireErrorClass::TypeMismatch => write!(f, "TypeMismatch"),
            WireErrorClass::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &EndpointError) -> WireErrorClass {
        let message = error.message.to_lowercase();
        let details = error.details.as_deref().unwrap_or("").to_lowercase();

        if TYPE_MISMATCH_SIGNATURES
            .iter()
            .any(|sig| message.contains(sig) || details.contains(sig))
        {
            return WireErrorClass::TypeMismatch;
        }

        WireErrorClass::Other
    }
}
