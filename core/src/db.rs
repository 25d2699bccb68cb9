//! Main module for the discodb core.  Implements the read side of an artifact: validate it once on
//! open then answer lookups directly from the bytes.  A reader never mutates anything so it can be
//! shared freely between threads.

use crate::crc::crc32;
use crate::db::header::{DbHeader, HEADER_SIZE};
use crate::db::value_map::{ValueDictionary, ValueIter, ValueMap};
use crate::db_buffer::DbBuffer;
use crate::error::deserialize::DeserializeError;
use crate::error::{FetchError, OpenError};
use crate::mphf::{ChdHash, PerfectHash};
use crate::varint::read_len_prefixed;
use std::path::Path;

pub mod builder;
pub mod header;
pub mod value_map;

/// Bytes per slot in the fingerprint section: crc32 of the key then the key record offset.
pub(crate) const FINGERPRINT_SIZE: usize = 12;
/// Bytes per slot in the offset section.
pub(crate) const OFFSET_SIZE: usize = 8;

/// An open, read only artifact.
/// B is anything that can be viewed as the artifact bytes, a borrowed slice, an owned buffer or
/// a memory map (see [`DbBuffer`]).
pub struct DbReader<B, H = ChdHash>
where
    B: AsRef<[u8]>,
    H: PerfectHash,
{
    buffer: B,
    header: DbHeader,
    hash: H,
}

impl<B, H> DbReader<B, H>
where
    B: AsRef<[u8]>,
    H: PerfectHash,
{
    /// Open an artifact, verifies the header, section layout and the crc32 of every byte.
    /// Any failure means nothing was opened.
    pub fn open(buffer: B) -> Result<Self, OpenError> {
        Self::open_internal(buffer, true)
    }

    /// Open an artifact without the full body checksum.  Structure is still validated and every
    /// record is bounds checked as it is read, so corruption shows up as a FetchError instead of
    /// a panic or wrong answer about key membership.  Use for large mapped artifacts that are
    /// already known good.
    pub fn open_trusted(buffer: B) -> Result<Self, OpenError> {
        Self::open_internal(buffer, false)
    }

    fn open_internal(buffer: B, verify_body: bool) -> Result<Self, OpenError> {
        let bytes = buffer.as_ref();
        let header = DbHeader::from_bytes(bytes)?;
        header.validate(bytes.len())?;
        if header.hash_algorithm() != H::ALGORITHM_ID {
            return Err(OpenError::UnknownHashAlgorithm(header.hash_algorithm()));
        }
        if verify_body && crc32(&bytes[HEADER_SIZE..]) != header.body_crc() {
            return Err(OpenError::ChecksumFailed);
        }
        let hash = H::deserialize(
            &bytes[header.hash_params().range()],
            header.seed(),
            header.keys(),
        )
        .map_err(OpenError::HashParams)?;
        if header.has_value_dictionary() {
            ValueDictionary::new(&bytes[header.dictionary().range()])
                .map_err(|_| OpenError::SectionOutOfBounds("dictionary"))?;
        }
        Ok(Self {
            buffer,
            header,
            hash,
        })
    }

    /// The validated header.
    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    /// Number of distinct keys.
    pub fn size(&self) -> u64 {
        self.header.keys()
    }

    /// Same as size(), an artifact always has at least one key.
    pub fn len(&self) -> usize {
        self.header.keys() as usize
    }

    /// Always false, empty artifacts can not be built.
    pub fn is_empty(&self) -> bool {
        self.header.keys() == 0
    }

    /// Was this artifact built with a value dictionary?
    pub fn has_value_dictionary(&self) -> bool {
        self.header.has_value_dictionary()
    }

    /// Consume the reader and return the underlying buffer.
    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// Lookup key.  Returns None if key is not in the artifact (including keys that hash onto a
    /// slot owned by another key) otherwise an iterator over its values in ascending byte order.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<ValueIter<'_>>, FetchError> {
        match self.find_slot(key)? {
            Some(slot) => self
                .value_map()
                .read(self.value_offset(slot))
                .map(Some)
                .map_err(FetchError::CorruptValues),
            None => Ok(None),
        }
    }

    /// Is key in the artifact?
    pub fn contains(&self, key: &[u8]) -> Result<bool, FetchError> {
        Ok(self.find_slot(key)?.is_some())
    }

    /// Number of values for key without decoding them, None if key is not present.
    pub fn value_count(&self, key: &[u8]) -> Result<Option<u64>, FetchError> {
        match self.find_slot(key)? {
            Some(slot) => self
                .value_map()
                .count(self.value_offset(slot))
                .map(Some)
                .map_err(FetchError::CorruptValues),
            None => Ok(None),
        }
    }

    /// Iterate every key in ascending byte order.  Each call starts a new pass.
    pub fn keys(&self) -> KeyIter<'_> {
        KeyIter {
            region: self.section_bytes(self.header.key_region().range()),
            remaining: self.header.keys(),
            corrupt: false,
        }
    }

    /// Iterate every (key, values) pair in key order.
    pub fn items(&self) -> impl Iterator<Item = Result<(&[u8], ValueIter<'_>), FetchError>> + '_ {
        self.keys().map(move |key| {
            self.lookup(key)?
                .map(|values| (key, values))
                .ok_or(FetchError::CorruptKey(DeserializeError::new(
                    "key record not reachable through the hash",
                )))
        })
    }

    /// Iterate the distinct values of a dictionary artifact in byte order.  None if the artifact
    /// was built without a dictionary.
    pub fn distinct_values(
        &self,
    ) -> Option<impl Iterator<Item = Result<&[u8], FetchError>> + '_> {
        self.dictionary().map(|dictionary| {
            dictionary
                .iter()
                .map(|value| value.map_err(FetchError::CorruptValues))
        })
    }

    fn section_bytes(&self, range: std::ops::Range<usize>) -> &[u8] {
        &self.buffer.as_ref()[range]
    }

    fn dictionary(&self) -> Option<ValueDictionary<'_>> {
        if self.header.has_value_dictionary() {
            // Checked in open().
            ValueDictionary::new(self.section_bytes(self.header.dictionary().range())).ok()
        } else {
            None
        }
    }

    fn value_map(&self) -> ValueMap<'_> {
        ValueMap::new(
            self.section_bytes(self.header.value_region().range()),
            self.dictionary(),
        )
    }

    /// Slot for key if key is really the key stored there.
    fn find_slot(&self, key: &[u8]) -> Result<Option<usize>, FetchError> {
        let slot = self.hash.slot(key);
        let fingerprints = self.section_bytes(self.header.fingerprints().range());
        let pos = slot * FINGERPRINT_SIZE;
        let mut buf32 = [0_u8; 4];
        buf32.copy_from_slice(&fingerprints[pos..(pos + 4)]);
        if u32::from_le_bytes(buf32) != crc32(key) {
            return Ok(None);
        }
        let mut buf64 = [0_u8; 8];
        buf64.copy_from_slice(&fingerprints[(pos + 4)..(pos + 12)]);
        let stored = self.key_at(u64::from_le_bytes(buf64))?;
        if stored == key {
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }

    fn key_at(&self, offset: u64) -> Result<&[u8], FetchError> {
        let region = self.section_bytes(self.header.key_region().range());
        if offset >= region.len() as u64 {
            return Err(FetchError::CorruptKey(DeserializeError::new(
                "key offset past end",
            )));
        }
        read_len_prefixed(&region[offset as usize..])
            .map(|(key, _)| key)
            .map_err(FetchError::CorruptKey)
    }

    fn value_offset(&self, slot: usize) -> u64 {
        let offsets = self.section_bytes(self.header.offsets().range());
        let pos = slot * OFFSET_SIZE;
        let mut buf64 = [0_u8; 8];
        buf64.copy_from_slice(&offsets[pos..(pos + 8)]);
        u64::from_le_bytes(buf64)
    }
}

impl<H: PerfectHash> DbReader<DbBuffer, H> {
    /// Memory map the artifact at path and open it (with the full checksum).
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        Self::open(DbBuffer::map_path(path)?)
    }
}

/// Iterates the keys of an artifact in byte order.
/// If a key record fails to decode the iterator ends early and is_corrupt() returns true.
#[derive(Debug, Clone)]
pub struct KeyIter<'a> {
    region: &'a [u8],
    remaining: u64,
    corrupt: bool,
}

impl<'a> KeyIter<'a> {
    /// True if iteration stopped on an undecodable key record.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }
}

impl<'a> Iterator for KeyIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match read_len_prefixed(self.region) {
            Ok((key, used)) => {
                self.region = &self.region[used..];
                self.remaining -= 1;
                Some(key)
            }
            Err(_) => {
                self.corrupt = true;
                self.remaining = 0;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
