#![deny(missing_docs)]

//! Provide a tokio async, sharded wrapper around the discodb core.  This is tokio specific but
//! should be easily adaptable to other runtimes.
//!
//! A database is a directory of shard artifacts, keys are assigned to shards by the top bits of
//! their hash.  [`ShardedBuilder`] builds every shard on its own thread, [`AsyncDb`] opens the
//! shards and answers lookups and queries across them.
//!
//! Each build writes a fresh generation subdirectory and only then swaps the `CURRENT` file to
//! name it, so a reader opens either the complete previous build or the complete new one.  Only
//! one builder may write to a directory at a time.

use dashmap::DashMap;
use discodb_core::db_config::DbConfig;
use discodb_core::error::query::QueryError;
use discodb_core::error::{FetchError, OpenError};
use discodb_core::{
    DbBuffer, DbReader, Query, QueryEngine, QueryLimits, QueryStatus, ValueIter, ValueSource,
};
use log::{debug, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

pub mod finalize_error;
pub mod sharded_builder;

pub use finalize_error::{EvaluateError, FinalizeError};
pub use sharded_builder::ShardedBuilder;

/// Default number of shard bits (8 shards).
pub const DEFAULT_SHARD_BITS: u32 = 3;
/// Largest supported number of shard bits.
pub const MAX_SHARD_BITS: u32 = 8;
/// Default queue depth for each build thread.
pub const DEFAULT_CHANNEL_DEPTH: usize = 10_000;

/// Configuration for a sharded database.  The same shard bits must be used to build and open.
#[derive(Clone, Debug)]
pub struct ShardedConfig {
    shard_bits: u32,
    channel_depth: usize,
    db_config: DbConfig,
}

impl Default for ShardedConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedConfig {
    /// Config with the defaults.
    pub fn new() -> Self {
        Self {
            shard_bits: DEFAULT_SHARD_BITS,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            db_config: DbConfig::new(),
        }
    }

    /// Use 2^bits shards (bits is capped at MAX_SHARD_BITS).
    pub fn set_shard_bits(mut self, bits: u32) -> Self {
        self.shard_bits = bits.min(MAX_SHARD_BITS);
        self
    }

    /// Queue depth for each build thread.
    pub fn set_channel_depth(mut self, depth: usize) -> Self {
        self.channel_depth = depth.max(1);
        self
    }

    /// Config used for every shard builder.
    pub fn set_db_config(mut self, db_config: DbConfig) -> Self {
        self.db_config = db_config;
        self
    }

    /// Shard bits.
    pub fn shard_bits(&self) -> u32 {
        self.shard_bits
    }

    /// Number of shards.
    pub fn shards(&self) -> usize {
        1 << self.shard_bits
    }

    /// Build thread queue depth.
    pub fn channel_depth(&self) -> usize {
        self.channel_depth
    }

    /// Per shard build config.
    pub fn db_config(&self) -> &DbConfig {
        &self.db_config
    }
}

/// Return the shard for a key.
pub fn shard_for_key(key: &[u8], shard_bits: u32) -> usize {
    if shard_bits == 0 {
        0
    } else {
        // Top bits, the perfect hash inside each shard uses its own seeded hash.
        (xxh3_64(key) >> (64 - shard_bits)) as usize
    }
}

/// Path of one shard artifact.
pub(crate) fn shard_path(dir: &Path, shard_bits: u32, shard: usize) -> PathBuf {
    dir.join(format!("shard_{}_{}.ddb", shard_bits, shard))
}

/// File in the database directory naming the published generation.
const CURRENT_FILE: &str = "CURRENT";

/// Directory holding one build's shard artifacts.
pub(crate) fn generation_dir(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("gen-{}", generation))
}

/// The generation CURRENT names, None if nothing was ever published to dir.
pub(crate) fn current_generation(dir: &Path) -> io::Result<Option<u64>> {
    let current = match fs::read_to_string(dir.join(CURRENT_FILE)) {
        Ok(current) => current,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    match current
        .trim()
        .strip_prefix("gen-")
        .and_then(|generation| generation.parse::<u64>().ok())
    {
        Some(generation) => Ok(Some(generation)),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid {} in {}", CURRENT_FILE, dir.display()),
        )),
    }
}

/// Point CURRENT at generation.  The rename is the commit of a build.
pub(crate) fn publish_generation(dir: &Path, generation: u64) -> io::Result<()> {
    let tmp_path = dir.join(format!(".{}.tmp-{}", CURRENT_FILE, std::process::id()));
    let res = write_current(&tmp_path, generation)
        .and_then(|_| fs::rename(&tmp_path, dir.join(CURRENT_FILE)));
    if res.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    res
}

fn write_current(path: &Path, generation: u64) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "gen-{}", generation)?;
    file.sync_all()
}

/// The open shards, a missing shard had no keys.
struct ShardSet {
    shard_bits: u32,
    shards: Vec<Option<DbReader<DbBuffer>>>,
}

impl ShardSet {
    fn shard(&self, key: &[u8]) -> Option<&DbReader<DbBuffer>> {
        self.shards[shard_for_key(key, self.shard_bits)].as_ref()
    }
}

impl ValueSource for ShardSet {
    fn lookup(&self, key: &[u8]) -> Result<Option<ValueIter<'_>>, FetchError> {
        match self.shard(key) {
            Some(db) => db.lookup(key),
            None => Ok(None),
        }
    }

    fn value_count(&self, key: &[u8]) -> Result<Option<u64>, FetchError> {
        match self.shard(key) {
            Some(db) => db.value_count(key),
            None => Ok(None),
        }
    }
}

/// Owned result of an async query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncQueryResult {
    /// Matching values in byte order.
    pub values: Vec<Vec<u8>>,
    /// Did the evaluation finish?
    pub status: QueryStatus,
    /// Number of values read.
    pub scanned: u64,
}

/// A query running on the blocking pool.
pub struct RunningQuery {
    id: u64,
    cancel: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<Result<AsyncQueryResult, QueryError>>,
}

impl RunningQuery {
    /// Id of this query (see AsyncDb::cancel()).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the query to stop, it returns a partial result at the next clause boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the result.
    pub async fn join(self) -> Result<AsyncQueryResult, EvaluateError> {
        Ok(self.handle.await??)
    }
}

/// This provides an async wrapper around a directory of shard artifacts.
/// Lookups use synchronous reads directly from the mapped shard, they are bounded cost (one hash,
/// one fingerprint check, one offset read) and moving them to another thread costs more than the
/// read.  Queries can read a great many values so they run on the blocking pool and can be
/// cancelled.
pub struct AsyncDb {
    dir: PathBuf,
    generation: u64,
    shards: Arc<ShardSet>,
    running: Arc<DashMap<u64, Arc<AtomicBool>>>,
    next_query_id: AtomicU64,
    // There should be little to no contention for this and it is never held across an await.
    limits: parking_lot::Mutex<QueryLimits>,
}

impl AsyncDb {
    /// Open the published shards in dir built with config's shard bits.
    /// Fails if any shard is corrupt or no shard exists at all.
    pub fn open<P: AsRef<Path>>(dir: P, config: &ShardedConfig) -> Result<Self, OpenError> {
        let dir = dir.as_ref().to_path_buf();
        let generation = current_generation(&dir)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("nothing published in {}", dir.display()),
            )
        })?;
        let gen_dir = generation_dir(&dir, generation);
        let mut shards: Vec<Option<DbReader<DbBuffer>>> = Vec::with_capacity(config.shards());
        for shard in 0..config.shards() {
            let path = shard_path(&gen_dir, config.shard_bits(), shard);
            if path.exists() {
                let db = DbReader::open_path(&path).map_err(|err| {
                    warn!("failed to open {}: {}", path.display(), err);
                    err
                })?;
                shards.push(Some(db));
            } else {
                debug!("no shard at {}", path.display());
                shards.push(None);
            }
        }
        if shards.iter().all(|s| s.is_none()) {
            return Err(OpenError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no shards in {}", gen_dir.display()),
            )));
        }
        Ok(Self {
            dir,
            generation,
            shards: Arc::new(ShardSet {
                shard_bits: config.shard_bits(),
                shards,
            }),
            running: Arc::new(DashMap::new()),
            next_query_id: AtomicU64::new(1),
            limits: parking_lot::Mutex::new(QueryLimits::new()),
        })
    }

    /// Directory of this DB.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The build generation that was opened.  Every successful build publishes the next one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Limits applied to every query started after this call.
    pub fn set_query_limits(&self, limits: QueryLimits) {
        *self.limits.lock() = limits;
    }

    /// Fetch the values stored at key, None if not found.
    pub async fn fetch<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<Vec<u8>>>, FetchError> {
        let values = self.shards.lookup(key.as_ref())?;
        Ok(values.map(|iter| iter.map(|v| v.to_vec()).collect()))
    }

    /// True if the database contains key.
    pub async fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> Result<bool, FetchError> {
        match self.shards.shard(key.as_ref()) {
            Some(db) => db.contains(key.as_ref()),
            None => Ok(false),
        }
    }

    /// Return the number of keys in all shards.
    pub async fn len(&self) -> u64 {
        self.shards.shards.iter().flatten().map(|db| db.size()).sum()
    }

    /// Is the DB empty?
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Return an iterator over every key, shard by shard (each shard in byte order).
    pub async fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.shards.shards.iter().flatten().flat_map(|db| db.keys())
    }

    /// Start evaluating query on the blocking pool.  Must be called from within a tokio runtime.
    pub fn submit(&self, query: Query) -> RunningQuery {
        let id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let limits = self.limits.lock().clone().set_cancel(cancel.clone());
        self.running.insert(id, cancel.clone());
        let shards = self.shards.clone();
        let running = self.running.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let res = QueryEngine::with_limits(&*shards, limits)
                .evaluate(&query)
                .map(|result| AsyncQueryResult {
                    values: result.to_vecs(),
                    status: result.status(),
                    scanned: result.scanned(),
                });
            running.remove(&id);
            res
        });
        RunningQuery { id, cancel, handle }
    }

    /// Evaluate query and wait for the result.
    pub async fn evaluate(&self, query: Query) -> Result<AsyncQueryResult, EvaluateError> {
        self.submit(query).join().await
    }

    /// Cancel the running query id.  Returns false if it is not running.
    pub fn cancel(&self, id: u64) -> bool {
        match self.running.get(&id) {
            Some(cancel) => {
                cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Ids of the queries still running.
    pub fn running_queries(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.running.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}
