//! Minimal perfect hashing.  The builder only needs something that maps its exact key set onto
//! [0, N) without collisions and can be stored in and reloaded from an artifact, so that is all
//! the [`PerfectHash`] trait asks for.  [`ChdHash`] is the default, a hash-and-displace scheme:
//! keys are split into small buckets and each bucket searches for a "pilot" value that moves all
//! of its keys onto free slots.
//!
//! Like every perfect hash this is undefined for keys outside the original set, it will happily
//! return some slot for them.  Callers must check the slot's fingerprint.

use crate::db_config::DbConfig;
use crate::error::deserialize::DeserializeError;
use xxhash_rust::xxh3::xxh3_128_with_seed;

/// A minimal perfect hash function that can be persisted in an artifact.
pub trait PerfectHash: Sized + Send + Sync {
    /// Recorded in the artifact header so a reader can refuse an artifact built with another
    /// algorithm.
    const ALGORITHM_ID: u16;

    /// Try to build a bijection from keys onto [0, keys.len()) using seed.
    /// Keys are distinct.  None means this seed did not work and a new one should be tried.
    fn generate(keys: &[&[u8]], seed: u64, config: &DbConfig) -> Option<Self>;

    /// The seed this function was generated with.
    fn seed(&self) -> u64;

    /// Slot for key.  Always < the number of keys it was generated for, even for foreign keys.
    fn slot(&self, key: &[u8]) -> usize;

    /// Append the parameters (everything except the seed and key count) to buffer.
    fn serialize(&self, buffer: &mut Vec<u8>);

    /// Rebuild from parameters written by serialize().
    fn deserialize(buffer: &[u8], seed: u64, keys: u64) -> Result<Self, DeserializeError>;
}

/// Mix a u64, used to spread pilots and derive retry seeds.
pub(crate) fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Map hash uniformly onto [0, n) without a division.
#[inline(always)]
fn fast_range(hash: u64, n: usize) -> usize {
    ((hash as u128 * n as u128) >> 64) as usize
}

/// Compress-hash-displace style perfect hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChdHash {
    seed: u64,
    keys: usize,
    pilots: Vec<u32>,
}

impl ChdHash {
    /// Split a key hash into (bucket selector, slot hash).
    #[inline(always)]
    fn key_hash(seed: u64, key: &[u8]) -> (u64, u64) {
        let hash = xxh3_128_with_seed(key, seed);
        ((hash >> 64) as u64, hash as u64)
    }

    /// Number of displacement buckets.
    pub fn buckets(&self) -> usize {
        self.pilots.len()
    }

    /// Slot for a key's slot hash displaced by a mixed pilot.  Mix again after the xor, the range
    /// reduction only sees the high bits.
    #[inline(always)]
    fn place(slot_hash: u64, pilot_mix: u64, n: usize) -> usize {
        fast_range(splitmix64(slot_hash ^ pilot_mix), n)
    }

    fn pilot_limit(keys: usize) -> u64 {
        (keys as u64).saturating_mul(64).clamp(1 << 16, u32::MAX as u64)
    }
}

impl PerfectHash for ChdHash {
    const ALGORITHM_ID: u16 = 1;

    fn generate(keys: &[&[u8]], seed: u64, config: &DbConfig) -> Option<Self> {
        let n = keys.len();
        if n == 0 {
            return None;
        }
        let load = config.bucket_load.max(1) as usize;
        let buckets = ((n + load - 1) / load).max(1);
        let mut bucket_keys: Vec<Vec<u64>> = vec![Vec::new(); buckets];
        for key in keys {
            let (selector, slot_hash) = Self::key_hash(seed, key);
            bucket_keys[fast_range(selector, buckets)].push(slot_hash);
        }
        // Two keys in one bucket with the same slot hash collide under every pilot.
        for bucket in bucket_keys.iter_mut() {
            bucket.sort_unstable();
            if bucket.windows(2).any(|w| w[0] == w[1]) {
                return None;
            }
        }
        let mut order: Vec<usize> = (0..buckets).collect();
        order.sort_by(|a, b| bucket_keys[*b].len().cmp(&bucket_keys[*a].len()));

        let limit = Self::pilot_limit(n);
        let mut taken = vec![false; n];
        let mut pilots = vec![0_u32; buckets];
        let mut positions: Vec<usize> = Vec::with_capacity(load * 4);
        for bucket in order {
            let slot_hashes = &bucket_keys[bucket];
            if slot_hashes.is_empty() {
                // Sorted by size, only empty buckets remain.
                break;
            }
            let mut placed = false;
            'pilot: for pilot in 0..limit {
                let mix = splitmix64(pilot);
                positions.clear();
                for slot_hash in slot_hashes {
                    let pos = Self::place(*slot_hash, mix, n);
                    if taken[pos] || positions.contains(&pos) {
                        continue 'pilot;
                    }
                    positions.push(pos);
                }
                for pos in &positions {
                    taken[*pos] = true;
                }
                pilots[bucket] = pilot as u32;
                placed = true;
                break;
            }
            if !placed {
                return None;
            }
        }
        Some(Self {
            seed,
            keys: n,
            pilots,
        })
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    fn slot(&self, key: &[u8]) -> usize {
        let (selector, slot_hash) = Self::key_hash(self.seed, key);
        let pilot = self.pilots[fast_range(selector, self.pilots.len())];
        Self::place(slot_hash, splitmix64(pilot as u64), self.keys)
    }

    fn serialize(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&(self.pilots.len() as u64).to_le_bytes());
        for pilot in &self.pilots {
            buffer.extend_from_slice(&pilot.to_le_bytes());
        }
    }

    fn deserialize(buffer: &[u8], seed: u64, keys: u64) -> Result<Self, DeserializeError> {
        if buffer.len() < 8 {
            return Err(DeserializeError::new("missing bucket count"));
        }
        if keys == 0 || keys > usize::MAX as u64 {
            return Err(DeserializeError::new("invalid key count"));
        }
        let mut buf64 = [0_u8; 8];
        buf64.copy_from_slice(&buffer[0..8]);
        let buckets = u64::from_le_bytes(buf64);
        if buckets == 0 || buckets > keys {
            return Err(DeserializeError::new("invalid bucket count"));
        }
        if (buffer.len() as u64 - 8) != buckets * 4 {
            return Err(DeserializeError::new("pilot table size mismatch"));
        }
        let pilots = buffer[8..]
            .chunks_exact(4)
            .map(|chunk| {
                let mut buf32 = [0_u8; 4];
                buf32.copy_from_slice(chunk);
                u32::from_le_bytes(buf32)
            })
            .collect();
        Ok(Self {
            seed,
            keys: keys as usize,
            pilots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(count: usize) -> Vec<Vec<u8>> {
        (0..count).map(|i| format!("key {i}").into_bytes()).collect()
    }

    fn assert_bijection(hash: &ChdHash, keys: &[&[u8]]) {
        let mut seen = vec![false; keys.len()];
        for key in keys {
            let slot = hash.slot(key);
            assert!(slot < keys.len());
            assert!(!seen[slot], "slot {} used twice", slot);
            seen[slot] = true;
        }
    }

    #[test]
    fn test_bijection_10k() {
        let keys = test_keys(10_000);
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let hash = ChdHash::generate(&refs, 7, &DbConfig::new()).unwrap();
        assert_bijection(&hash, &refs);
        assert_eq!(hash.buckets(), 2_000);
    }

    #[test]
    fn test_single_key() {
        let refs: Vec<&[u8]> = vec![b"only"];
        let hash = ChdHash::generate(&refs, 0, &DbConfig::new()).unwrap();
        assert_eq!(hash.slot(b"only"), 0);
        // Foreign keys still land on slot 0, there is nowhere else to go.
        assert_eq!(hash.slot(b"other"), 0);
        assert!(ChdHash::generate(&[], 0, &DbConfig::new()).is_none());
    }

    #[test]
    fn test_params_round_trip() {
        let keys = test_keys(500);
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let config = DbConfig::new().set_bucket_load(3);
        let hash = ChdHash::generate(&refs, 99, &config).unwrap();
        let mut buffer = Vec::new();
        hash.serialize(&mut buffer);
        assert_eq!(buffer.len(), 8 + 4 * hash.buckets());
        let loaded = ChdHash::deserialize(&buffer, 99, 500).unwrap();
        assert_eq!(loaded, hash);
        for key in &refs {
            assert_eq!(loaded.slot(key), hash.slot(key));
        }
        assert!(ChdHash::deserialize(&buffer[..buffer.len() - 1], 99, 500).is_err());
        assert!(ChdHash::deserialize(&buffer, 99, 0).is_err());
        assert!(ChdHash::deserialize(&buffer[..4], 99, 500).is_err());
    }

    #[test]
    fn test_seed_changes_layout() {
        let keys = test_keys(64);
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let a = ChdHash::generate(&refs, 1, &DbConfig::new()).unwrap();
        let b = ChdHash::generate(&refs, splitmix64(1), &DbConfig::new()).unwrap();
        assert_bijection(&a, &refs);
        assert_bijection(&b, &refs);
        assert!(refs.iter().any(|k| a.slot(k) != b.slot(k)));
    }

    /// Generate with the same seed chain the builder retries with.
    fn generate_retrying(refs: &[&[u8]]) -> Option<ChdHash> {
        std::iter::successors(Some(crate::db_config::DEFAULT_SEED), |seed| {
            Some(splitmix64(*seed))
        })
        .take(16)
        .find_map(|seed| ChdHash::generate(refs, seed, &DbConfig::new()))
    }

    #[test]
    fn test_small_sets_short_keys() {
        for n in 1..=500 {
            let keys: Vec<Vec<u8>> = (0..n).map(|i| format!("k{i}").into_bytes()).collect();
            let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
            let hash = generate_retrying(&refs);
            let hash = hash.unwrap_or_else(|| panic!("no hash for {} keys", n));
            assert_bijection(&hash, &refs);
        }
    }

    #[test]
    fn test_word_list() {
        let words = [
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
        ];
        for n in 1..=words.len() {
            let refs: Vec<&[u8]> = words[..n].iter().map(|w| w.as_bytes()).collect();
            let hash = generate_retrying(&refs).unwrap();
            assert_bijection(&hash, &refs);
        }
        // Most seeds work outright for a handful of keys.
        let refs: Vec<&[u8]> = words.iter().map(|w| w.as_bytes()).collect();
        let placed = (0..32_u64)
            .filter(|seed| ChdHash::generate(&refs, *seed, &DbConfig::new()).is_some())
            .count();
        assert!(placed >= 24, "only {} of 32 seeds worked", placed);
    }
}
