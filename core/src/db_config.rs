//! Define the configuration used to build a discodb artifact.

use crate::db::builder::DbBuilder;
use crate::mphf::PerfectHash;

/// Default first seed for the perfect hash.
pub const DEFAULT_SEED: u64 = 0x6469_7363_6f64_6200;
/// Default number of seeds to try before giving up on a build.
pub const DEFAULT_MAX_HASH_ATTEMPTS: u32 = 16;
/// Default average number of keys per perfect hash bucket.
pub const DEFAULT_BUCKET_LOAD: u32 = 5;

/// Configuration for building a database.
#[derive(Clone, Debug)]
pub struct DbConfig {
    pub(crate) dedup_values: bool,
    pub(crate) seed: u64,
    pub(crate) max_hash_attempts: u32,
    pub(crate) bucket_load: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DbConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            dedup_values: false,
            seed: DEFAULT_SEED,
            max_hash_attempts: DEFAULT_MAX_HASH_ATTEMPTS,
            bucket_load: DEFAULT_BUCKET_LOAD,
        }
    }

    /// Store each distinct value once in a shared dictionary and reference it by id.
    /// Smaller artifacts when values repeat across keys, at the cost of hashing every value
    /// during the build.
    pub fn dedup_values(mut self) -> Self {
        self.dedup_values = true;
        self
    }

    /// Set the seed used for the first perfect hash attempt.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the number of seeds to try before failing the build.  Zero is treated as one.
    pub fn set_max_hash_attempts(mut self, attempts: u32) -> Self {
        self.max_hash_attempts = attempts.max(1);
        self
    }

    /// Set the average keys per perfect hash bucket.  Larger values make the hash parameters
    /// smaller but the build slower.  Zero is treated as one.
    pub fn set_bucket_load(mut self, load: u32) -> Self {
        self.bucket_load = load.max(1);
        self
    }

    /// Is the value dictionary enabled?
    pub fn is_dedup_values(&self) -> bool {
        self.dedup_values
    }

    /// Seed of the first hash attempt.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Retry budget for the perfect hash.
    pub fn max_hash_attempts(&self) -> u32 {
        self.max_hash_attempts
    }

    /// Consumes the config and returns an empty builder.
    pub fn build<H: PerfectHash>(self) -> DbBuilder<H> {
        DbBuilder::with_config(self)
    }
}
