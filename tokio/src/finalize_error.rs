//! Contains errors that extend the core errors with failures from the shard threads and tasks.

use discodb_core::error::query::QueryError;
use std::error::Error;
use std::{fmt, io};

/// Error from the async finalize().
#[derive(Debug)]
pub enum FinalizeError {
    /// No keys were added to any shard.
    EmptyInput,
    /// A shard failed to build or publish its artifact.
    Shard(usize, discodb_core::error::finalize::FinalizeError),
    /// Could not create the output directory.
    Io(io::Error),
    /// The channel to send commands to a build thread has closed (the thread is gone).
    SendChannelClosed,
    /// Failed to receive a response, the build thread ended without answering.
    ReceiveFailed,
}

impl Error for FinalizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Shard(_, e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::EmptyInput => write!(f, "no keys to build"),
            Self::Shard(shard, e) => write!(f, "shard {}: {}", shard, e),
            Self::Io(e) => write!(f, "io: {}", e),
            Self::SendChannelClosed => write!(f, "send channel closed"),
            Self::ReceiveFailed => write!(f, "receive failed"),
        }
    }
}

impl From<io::Error> for FinalizeError {
    fn from(io_err: io::Error) -> Self {
        Self::Io(io_err)
    }
}

/// Error from evaluate() or RunningQuery::join().
#[derive(Debug)]
pub enum EvaluateError {
    /// The query was invalid or hit a corrupt record.
    Query(QueryError),
    /// The blocking task running the query panicked or was aborted.
    Join(tokio::task::JoinError),
}

impl EvaluateError {
    /// True if the query itself was malformed.
    pub fn is_invalid_query(&self) -> bool {
        matches!(self, Self::Query(e) if e.is_invalid_query())
    }
}

impl Error for EvaluateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(e) => Some(e),
            Self::Join(e) => Some(e),
        }
    }
}

impl fmt::Display for EvaluateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Query(e) => write!(f, "{}", e),
            Self::Join(e) => write!(f, "query task failed: {}", e),
        }
    }
}

impl From<QueryError> for EvaluateError {
    fn from(err: QueryError) -> Self {
        Self::Query(err)
    }
}

impl From<tokio::task::JoinError> for EvaluateError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err)
    }
}
