//! Contains the error for the finalize() functions.

use std::error::Error;
use std::fmt;
use std::io;

/// Error building an artifact.  No artifact (or partial artifact) is produced when this is
/// returned.
#[derive(Debug)]
pub enum FinalizeError {
    /// No keys were added to the builder.
    EmptyInput,
    /// The perfect hash generator did not produce a bijection within the retry budget.
    HashExhausted {
        /// Number of seeds tried.
        attempts: u32,
    },
    /// A section grew past what the format can address.
    SectionTooLarge(&'static str),
    /// An IO error writing or publishing the artifact file.
    Io(io::Error),
}

impl FinalizeError {
    /// True if this is the empty input error.
    pub fn is_empty_input(&self) -> bool {
        matches!(self, Self::EmptyInput)
    }

    /// True if this is a build failure (hash exhaustion or size limits).
    pub fn is_build_error(&self) -> bool {
        matches!(self, Self::HashExhausted { .. } | Self::SectionTooLarge(_))
    }
}

impl Error for FinalizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::EmptyInput => write!(f, "no keys to build"),
            Self::HashExhausted { attempts } => {
                write!(f, "perfect hash failed after {} attempts", attempts)
            }
            Self::SectionTooLarge(section) => write!(f, "{} section too large", section),
            Self::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for FinalizeError {
    fn from(io_err: io::Error) -> Self {
        Self::Io(io_err)
    }
}
