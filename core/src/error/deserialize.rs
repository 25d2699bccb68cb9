//! Define the deserialization error.

use std::error::Error;
use std::fmt;

/// Error type for decoding bytes read from an artifact (varints, hash parameters, records).
/// Contains a static message describing what was malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeserializeError {
    message: &'static str,
}

impl Error for DeserializeError {}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl DeserializeError {
    /// Create a new DeserializeError with a message.
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }

    /// The message describing the failure.
    pub fn message(&self) -> &'static str {
        self.message
    }
}
