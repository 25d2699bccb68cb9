//! Contains the error for query evaluation.

use crate::error::FetchError;
use std::error::Error;
use std::fmt;

/// Error from evaluate().
#[derive(Debug)]
pub enum QueryError {
    /// The query has no clauses.
    EmptyQuery,
    /// The clause at this index has no keys.
    EmptyClause(usize),
    /// A lookup hit a corrupt record.
    Fetch(FetchError),
}

impl QueryError {
    /// True if the query itself was malformed (as opposed to a storage failure).
    pub fn is_invalid_query(&self) -> bool {
        matches!(self, Self::EmptyQuery | Self::EmptyClause(_))
    }
}

impl Error for QueryError {}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::EmptyQuery => write!(f, "invalid query: no clauses"),
            Self::EmptyClause(idx) => write!(f, "invalid query: clause {} has no keys", idx),
            Self::Fetch(e) => write!(f, "fetch: {}", e),
        }
    }
}

impl From<FetchError> for QueryError {
    fn from(err: FetchError) -> Self {
        Self::Fetch(err)
    }
}
