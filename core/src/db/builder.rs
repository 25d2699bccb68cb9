//! Accumulates key -> value set associations and compiles them into an artifact.

use crate::crc::crc32;
use crate::db::header::{DbHeader, SectionLens, HEADER_SIZE};
use crate::db::value_map::{write_dictionary, ValueMapWriter};
use crate::db::{FINGERPRINT_SIZE, OFFSET_SIZE};
use crate::db_config::DbConfig;
use crate::error::finalize::FinalizeError;
use crate::mphf::{splitmix64, ChdHash, PerfectHash};
use crate::varint::write_len_prefixed;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Single writer accumulation state for one artifact.
/// Keys and values are kept sorted so the same associations always produce the same bytes no
/// matter what order they were added in.
pub struct DbBuilder<H: PerfectHash = ChdHash> {
    entries: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
    config: DbConfig,
    _hash: PhantomData<H>,
}

impl<H: PerfectHash> Default for DbBuilder<H> {
    fn default() -> Self {
        Self::with_config(DbConfig::new())
    }
}

impl<H: PerfectHash> DbBuilder<H> {
    /// Empty builder with the default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty builder using config.
    pub fn with_config(config: DbConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            config,
            _hash: PhantomData,
        }
    }

    /// The config this builder will finalize with.
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Add value to key's value set.  Adding the same (key, value) again does nothing.
    /// Returns true if the pair was new.
    pub fn add<K, V>(&mut self, key: K, value: V) -> bool
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let key = key.as_ref();
        let value = value.as_ref();
        if let Some(values) = self.entries.get_mut(key) {
            if values.contains(value) {
                return false;
            }
            values.insert(value.to_vec());
        } else {
            let mut values = BTreeSet::new();
            values.insert(value.to_vec());
            self.entries.insert(key.to_vec(), values);
        }
        true
    }

    /// Add every value in values to key.  Same as calling add() for each.
    pub fn add_values<K, I, V>(&mut self, key: K, values: I)
    where
        K: AsRef<[u8]>,
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        let key = key.as_ref();
        for value in values {
            self.add(key, value);
        }
    }

    /// Number of distinct keys added.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Have no keys been added?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Produce the artifact bytes.
    /// Fails with EmptyInput if nothing was added or HashExhausted if no seed in the retry budget
    /// produced a perfect hash.  The builder is left untouched either way.
    pub fn finalize(&self) -> Result<Vec<u8>, FinalizeError> {
        if self.entries.is_empty() {
            return Err(FinalizeError::EmptyInput);
        }
        let keys: Vec<&[u8]> = self.entries.keys().map(|k| k.as_slice()).collect();
        let n = keys.len();
        let hash = self.generate_hash(&keys)?;

        let mut key_region = Vec::new();
        let mut key_offsets = Vec::with_capacity(n);
        for key in &keys {
            key_offsets.push(key_region.len() as u64);
            write_len_prefixed(&mut key_region, key);
        }

        let distinct: Option<BTreeSet<&[u8]>> = if self.config.dedup_values {
            Some(
                self.entries
                    .values()
                    .flat_map(|values| values.iter().map(|v| v.as_slice()))
                    .collect(),
            )
        } else {
            None
        };
        let mut writer = match &distinct {
            Some(distinct) => ValueMapWriter::with_dictionary(distinct),
            None => ValueMapWriter::new(),
        };

        let mut fingerprints = vec![0_u8; n * FINGERPRINT_SIZE];
        let mut offsets = vec![0_u8; n * OFFSET_SIZE];
        for (i, (key, values)) in self.entries.iter().enumerate() {
            let (value_offset, _) = writer.append(values.iter().map(|v| v.as_slice()));
            let slot = hash.slot(key);
            let pos = slot * FINGERPRINT_SIZE;
            fingerprints[pos..(pos + 4)].copy_from_slice(&crc32(key).to_le_bytes());
            fingerprints[(pos + 4)..(pos + 12)].copy_from_slice(&key_offsets[i].to_le_bytes());
            let pos = slot * OFFSET_SIZE;
            offsets[pos..(pos + 8)].copy_from_slice(&value_offset.to_le_bytes());
        }
        let value_count = match &distinct {
            Some(distinct) => distinct.len() as u64,
            None => writer.stored(),
        };
        let value_region = writer.into_region();
        let dictionary = match &distinct {
            Some(distinct) => write_dictionary(distinct.iter().copied(), distinct.len()),
            None => Vec::new(),
        };
        let mut hash_params = Vec::new();
        hash.serialize(&mut hash_params);

        let mut header = DbHeader::new(
            H::ALGORITHM_ID,
            hash.seed(),
            n as u64,
            value_count,
            distinct.is_some(),
            SectionLens {
                hash_params: hash_params.len() as u64,
                key_region: key_region.len() as u64,
                value_region: value_region.len() as u64,
                dictionary: dictionary.len() as u64,
            },
        )
        .ok_or(FinalizeError::SectionTooLarge("artifact"))?;

        let mut artifact = Vec::with_capacity(header.total_len() as usize);
        artifact.extend_from_slice(&[0_u8; HEADER_SIZE]);
        for section in [
            &hash_params,
            &fingerprints,
            &offsets,
            &key_region,
            &value_region,
            &dictionary,
        ] {
            artifact.extend_from_slice(section);
        }
        debug_assert_eq!(artifact.len() as u64, header.total_len());
        header.set_body_crc(crc32(&artifact[HEADER_SIZE..]));
        artifact[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        info!(
            "finalized artifact: {} keys, {} values, {} bytes (dictionary: {})",
            n,
            value_count,
            artifact.len(),
            distinct.is_some()
        );
        Ok(artifact)
    }

    /// Finalize and publish the artifact at path.
    /// The bytes are written to a temporary file next to path, synced and then renamed over path
    /// so a reader never sees a partial artifact.  On any error path is left as it was.
    /// Returns the artifact length.
    pub fn finalize_to_path<P: AsRef<Path>>(&self, path: P) -> Result<u64, FinalizeError> {
        let path = path.as_ref();
        let artifact = self.finalize()?;
        let tmp_path = temp_path(path);
        let res = write_synced(&tmp_path, &artifact).and_then(|_| fs::rename(&tmp_path, path));
        if let Err(err) = res {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        info!("published {}", path.display());
        Ok(artifact.len() as u64)
    }

    /// Try seeds until one produces a verified bijection.
    /// Attempt 0 uses the configured seed, each later attempt uses splitmix64 of the previous.
    fn generate_hash(&self, keys: &[&[u8]]) -> Result<H, FinalizeError> {
        let attempts = self.config.max_hash_attempts.max(1);
        let mut seed = self.config.seed;
        for attempt in 0..attempts {
            if attempt > 0 {
                seed = splitmix64(seed);
            }
            debug!(
                "perfect hash attempt {} for {} keys, seed {:#x}",
                attempt,
                keys.len(),
                seed
            );
            match H::generate(keys, seed, &self.config) {
                Some(hash) if is_bijection(&hash, keys) => return Ok(hash),
                Some(_) => warn!("perfect hash seed {:#x} was not a bijection", seed),
                None => warn!("perfect hash seed {:#x} failed", seed),
            }
        }
        Err(FinalizeError::HashExhausted { attempts })
    }
}

fn is_bijection<H: PerfectHash>(hash: &H, keys: &[&[u8]]) -> bool {
    let mut seen = vec![false; keys.len()];
    for key in keys {
        let slot = hash.slot(key);
        if slot >= seen.len() || seen[slot] {
            return false;
        }
        seen[slot] = true;
    }
    true
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbReader;
    use crate::error::deserialize::DeserializeError;

    /// A "perfect hash" that never works.
    struct NeverHash;

    impl PerfectHash for NeverHash {
        const ALGORITHM_ID: u16 = 900;

        fn generate(_keys: &[&[u8]], _seed: u64, _config: &DbConfig) -> Option<Self> {
            None
        }

        fn seed(&self) -> u64 {
            0
        }

        fn slot(&self, _key: &[u8]) -> usize {
            0
        }

        fn serialize(&self, _buffer: &mut Vec<u8>) {}

        fn deserialize(_buf: &[u8], _seed: u64, _keys: u64) -> Result<Self, DeserializeError> {
            Err(DeserializeError::new("never"))
        }
    }

    /// Claims success but maps every key to slot 0.
    struct LyingHash;

    impl PerfectHash for LyingHash {
        const ALGORITHM_ID: u16 = 901;

        fn generate(_keys: &[&[u8]], _seed: u64, _config: &DbConfig) -> Option<Self> {
            Some(LyingHash)
        }

        fn seed(&self) -> u64 {
            0
        }

        fn slot(&self, _key: &[u8]) -> usize {
            0
        }

        fn serialize(&self, _buffer: &mut Vec<u8>) {}

        fn deserialize(_buf: &[u8], _seed: u64, _keys: u64) -> Result<Self, DeserializeError> {
            Ok(LyingHash)
        }
    }

    #[test]
    fn test_empty() {
        let builder: DbBuilder = DbBuilder::new();
        assert!(builder.is_empty());
        assert!(matches!(builder.finalize(), Err(FinalizeError::EmptyInput)));
        assert!(builder.finalize().unwrap_err().is_empty_input());
    }

    #[test]
    fn test_add_idempotent() {
        let mut builder: DbBuilder = DbBuilder::new();
        assert!(builder.add("a", "x"));
        assert!(!builder.add("a", "x"));
        assert!(builder.add("a", "y"));
        builder.add_values("b", ["y", "y", "z"]);
        assert_eq!(builder.len(), 2);
        let once = builder.finalize().unwrap();
        builder.add("a", "x");
        builder.add_values("b", ["z"]);
        assert_eq!(builder.finalize().unwrap(), once);
    }

    #[test]
    fn test_insert_order_independent() {
        let pairs: Vec<(String, String)> = (0..200)
            .map(|i| (format!("key {}", i % 37), format!("value {}", i)))
            .collect();
        let mut forward: DbBuilder = DbBuilder::new();
        for (k, v) in &pairs {
            forward.add(k, v);
        }
        let mut backward: DbBuilder = DbBuilder::new();
        for (k, v) in pairs.iter().rev() {
            backward.add(k, v);
        }
        assert_eq!(forward.finalize().unwrap(), backward.finalize().unwrap());
    }

    #[test]
    fn test_dictionary_smaller() {
        let mut plain: DbBuilder = DbBuilder::new();
        let mut dedup: DbBuilder = DbConfig::new().dedup_values().build();
        let shared = "a value that repeats across a great many keys";
        for i in 0..100 {
            plain.add(format!("k{i}"), shared);
            dedup.add(format!("k{i}"), shared);
        }
        assert!(dedup.config().is_dedup_values());
        assert!(dedup.finalize().unwrap().len() < plain.finalize().unwrap().len());
    }

    #[test]
    fn test_small_inputs() {
        for n in 1..=500 {
            let mut builder: DbBuilder = DbBuilder::new();
            for i in 0..n {
                builder.add(format!("k{i}"), "v");
            }
            let artifact = builder.finalize().unwrap_or_else(|e| panic!("{} keys: {}", n, e));
            let reader: DbReader<&[u8]> = DbReader::open(artifact.as_slice()).unwrap();
            assert_eq!(reader.size(), n);
        }
        let mut builder: DbBuilder = DbConfig::new().dedup_values().build();
        for word in [
            "apple",
            "banana",
            "cherry",
            "date",
            "elderberry",
            "fig",
            "grape",
            "honeydew",
            "kiwi",
            "lemon",
            "mango",
            "nectarine",
        ] {
            builder.add(word, &word[..1]);
        }
        let artifact = builder.finalize().unwrap();
        let reader: DbReader<&[u8]> = DbReader::open(artifact.as_slice()).unwrap();
        let values: Vec<&[u8]> = reader.lookup(b"kiwi").unwrap().unwrap().collect();
        assert_eq!(values, vec![b"k".as_slice()]);
    }

    #[test]
    fn test_hash_exhausted() {
        let mut builder: DbBuilder<NeverHash> = DbConfig::new().set_max_hash_attempts(3).build();
        builder.add("a", "x");
        let err = builder.finalize().unwrap_err();
        assert!(err.is_build_error());
        assert!(matches!(err, FinalizeError::HashExhausted { attempts: 3 }));

        let mut builder: DbBuilder<LyingHash> = DbBuilder::new();
        builder.add("a", "x");
        builder.add("b", "x");
        assert!(matches!(
            builder.finalize(),
            Err(FinalizeError::HashExhausted { attempts: 16 })
        ));
        // A single key is trivially a bijection onto slot 0.
        let mut builder: DbBuilder<LyingHash> = DbBuilder::new();
        builder.add("a", "x");
        assert!(builder.finalize().is_ok());
    }

    #[test]
    fn test_finalize_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ddb");
        let mut builder: DbBuilder = DbBuilder::new();
        builder.add("a", "x");
        let len = builder.finalize_to_path(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len() as u64, len);

        // A failed build leaves the published artifact alone and no temp files behind.
        let mut failing: DbBuilder<NeverHash> = DbBuilder::new();
        failing.add("b", "y");
        assert!(failing.finalize_to_path(&path).is_err());
        assert_eq!(fs::read(&path).unwrap(), builder.finalize().unwrap());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        // Publishing into a missing directory fails without creating anything.
        let missing = dir.path().join("nope").join("test.ddb");
        assert!(matches!(
            builder.finalize_to_path(&missing),
            Err(FinalizeError::Io(_))
        ));
    }
}
