#![deny(missing_docs)]

//! Crate to implement discodb, an immutable key to multi-value store.
//! A batch job adds (key, value) associations to a builder which compiles them into a single
//! artifact.  The artifact is never changed after that, any number of readers (and threads) can
//! look keys up in it and evaluate boolean queries over those lookups without locking.
//!
//! Keys are indexed with a minimal perfect hash (see [`mphf`]) so a lookup is one hash, one
//! fingerprint check and one offset read.  The fingerprint stores a crc32 of the key plus the
//! location of the full key so keys that were never added are always rejected.
//!
//! It uses CRC32 checksums to verify the header and the whole artifact on open
//! (See https://github.com/srijs/rust-crc32fast).

pub(crate) mod crc;
pub mod db;
pub mod db_buffer;
pub mod db_config;
pub mod error;
pub mod mphf;
pub mod query;
pub mod varint;

pub use db::builder::DbBuilder;
pub use db::value_map::ValueIter;
pub use db::{DbReader, KeyIter};
pub use db_buffer::DbBuffer;
pub use db_config::DbConfig;
pub use mphf::{ChdHash, PerfectHash};
pub use query::{
    Clause, Literal, Query, QueryEngine, QueryLimits, QueryResult, QueryStatus, StopReason,
    ValueSource,
};
