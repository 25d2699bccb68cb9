//! Implements the errors for a discodb.

pub mod deserialize;
pub mod finalize;
pub mod query;

use crate::error::deserialize::DeserializeError;
use std::error::Error;
use std::fmt;
use std::io;

/// Error on opening an artifact.  Everything except Io means the bytes are not a valid artifact
/// (corrupt, truncated or some other file type).
#[derive(Debug)]
pub enum OpenError {
    /// Fewer bytes than the header or the length recorded in the header.
    Truncated,
    /// The type string for the header was invalid- corrupted or incorrect file type.
    InvalidType,
    /// The format version is not one this code can read.
    UnsupportedVersion(u16),
    /// The header crc32 does not match.
    HeaderCrcFailed,
    /// The crc32 over the sections does not match the one recorded in the header.
    ChecksumFailed,
    /// A section descriptor points outside the artifact or has the wrong size.
    SectionOutOfBounds(&'static str),
    /// The artifact was built with a different perfect hash algorithm.
    UnknownHashAlgorithm(u16),
    /// The stored hash parameters could not be decoded.
    HashParams(DeserializeError),
    /// An underlying IO error while reading or mapping the file.
    Io(io::Error),
}

impl OpenError {
    /// True if the failure was caused by invalid bytes (not an IO failure).
    pub fn is_corrupt_format(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl Error for OpenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::HashParams(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Truncated => write!(f, "corrupt format: truncated"),
            Self::InvalidType => write!(f, "corrupt format: invalid type id"),
            Self::UnsupportedVersion(v) => write!(f, "corrupt format: unsupported version {}", v),
            Self::HeaderCrcFailed => write!(f, "corrupt format: header crc32 mismatch"),
            Self::ChecksumFailed => write!(f, "corrupt format: crc32 mismatch"),
            Self::SectionOutOfBounds(section) => {
                write!(f, "corrupt format: {} section out of bounds", section)
            }
            Self::UnknownHashAlgorithm(id) => {
                write!(f, "corrupt format: unknown hash algorithm {}", id)
            }
            Self::HashParams(e) => write!(f, "corrupt format: hash params: {}", e),
            Self::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(io_err: io::Error) -> Self {
        Self::Io(io_err)
    }
}

/// Error reading a record from an open artifact.  Only possible if the artifact was opened
/// without verifying the body checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// A key record could not be decoded.
    CorruptKey(DeserializeError),
    /// A value list could not be decoded.
    CorruptValues(DeserializeError),
}

impl Error for FetchError {}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::CorruptKey(e) => write!(f, "corrupt key: {}", e),
            Self::CorruptValues(e) => write!(f, "corrupt values: {}", e),
        }
    }
}
