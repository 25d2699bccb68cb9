//! Define and validate the artifact header.

use crate::crc::{add_crc32, check_crc};
use crate::db::{FINGERPRINT_SIZE, OFFSET_SIZE};
use crate::error::OpenError;
use std::ops::Range;

/// Size of an artifact header, includes the crc32 checksum at the end of the header.
pub const HEADER_SIZE: usize = 160;

const TYPE_ID: [u8; 8] = *b"discodb\0";
const FORMAT_VERSION: u16 = 1;
const FLAG_VALUE_DICTIONARY: u16 = 0x0001;
const SECTIONS: usize = 6;

/// Location of one section of the artifact (absolute byte offset and length).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Section {
    offset: u64,
    len: u64,
}

impl Section {
    pub(crate) fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Absolute offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Is the section empty?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte range in the artifact.  Only valid after the header has been validated against the
    /// artifact length.
    pub fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.len) as usize
    }

    fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }
}

/// Header for a discodb artifact.  Describes where every section lives plus everything needed
/// to recompute the perfect hash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbHeader {
    type_id: [u8; 8], // The characters "discodb\0"
    version: u16,
    flags: u16,
    hash_algorithm: u16,
    keys: u64,
    values: u64,
    seed: u64,
    hash_params: Section,
    fingerprints: Section,
    offsets: Section,
    key_region: Section,
    value_region: Section,
    dictionary: Section,
    total_len: u64,
    body_crc: u32,
}

/// Section sizes used to lay out a new header.
pub(crate) struct SectionLens {
    pub hash_params: u64,
    pub key_region: u64,
    pub value_region: u64,
    pub dictionary: u64,
}

impl DbHeader {
    /// Build a header for a new artifact, sections are laid out back to back after the header.
    /// The body crc is filled in later with set_body_crc().
    pub(crate) fn new(
        hash_algorithm: u16,
        seed: u64,
        keys: u64,
        values: u64,
        has_dictionary: bool,
        lens: SectionLens,
    ) -> Option<Self> {
        let hash_params = Section::new(HEADER_SIZE as u64, lens.hash_params);
        let fingerprints = Section::new(
            hash_params.end()?,
            keys.checked_mul(FINGERPRINT_SIZE as u64)?,
        );
        let offsets = Section::new(fingerprints.end()?, keys.checked_mul(OFFSET_SIZE as u64)?);
        let key_region = Section::new(offsets.end()?, lens.key_region);
        let value_region = Section::new(key_region.end()?, lens.value_region);
        let dictionary = Section::new(value_region.end()?, lens.dictionary);
        let total_len = dictionary.end()?;
        if total_len > usize::MAX as u64 {
            return None;
        }
        Some(Self {
            type_id: TYPE_ID,
            version: FORMAT_VERSION,
            flags: if has_dictionary {
                FLAG_VALUE_DICTIONARY
            } else {
                0
            },
            hash_algorithm,
            keys,
            values,
            seed,
            hash_params,
            fingerprints,
            offsets,
            key_region,
            value_region,
            dictionary,
            total_len,
            body_crc: 0,
        })
    }

    pub(crate) fn set_body_crc(&mut self, crc: u32) {
        self.body_crc = crc;
    }

    fn sections(&self) -> [(&'static str, Section); SECTIONS] {
        [
            ("hash params", self.hash_params),
            ("fingerprint", self.fingerprints),
            ("offset", self.offsets),
            ("key", self.key_region),
            ("value", self.value_region),
            ("dictionary", self.dictionary),
        ]
    }

    /// Encode this header, the last four bytes are the header crc32.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buffer = [0_u8; HEADER_SIZE];
        let mut pos = 0;
        buffer[pos..8].copy_from_slice(&self.type_id);
        pos += 8;
        buffer[pos..(pos + 2)].copy_from_slice(&self.version.to_le_bytes());
        pos += 2;
        buffer[pos..(pos + 2)].copy_from_slice(&self.flags.to_le_bytes());
        pos += 2;
        buffer[pos..(pos + 2)].copy_from_slice(&self.hash_algorithm.to_le_bytes());
        pos += 4; // 2 reserved bytes
        buffer[pos..(pos + 8)].copy_from_slice(&self.keys.to_le_bytes());
        pos += 8;
        buffer[pos..(pos + 8)].copy_from_slice(&self.values.to_le_bytes());
        pos += 8;
        buffer[pos..(pos + 8)].copy_from_slice(&self.seed.to_le_bytes());
        pos += 8;
        for (_, section) in self.sections() {
            buffer[pos..(pos + 8)].copy_from_slice(&section.offset.to_le_bytes());
            pos += 8;
            buffer[pos..(pos + 8)].copy_from_slice(&section.len.to_le_bytes());
            pos += 8;
        }
        buffer[pos..(pos + 8)].copy_from_slice(&self.total_len.to_le_bytes());
        pos += 8;
        buffer[pos..(pos + 4)].copy_from_slice(&self.body_crc.to_le_bytes());
        pos += 4;
        // Zero padding then the crc.
        pos += 8;
        assert_eq!(pos + 4, HEADER_SIZE);
        add_crc32(&mut buffer);
        buffer
    }

    /// Decode a header from the start of bytes.  Checks the type id, version and header crc but
    /// not the sections, see validate().
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OpenError> {
        if bytes.len() < HEADER_SIZE {
            return Err(OpenError::Truncated);
        }
        let buffer = &bytes[..HEADER_SIZE];
        let mut type_id = [0_u8; 8];
        type_id.copy_from_slice(&buffer[0..8]);
        if type_id != TYPE_ID {
            return Err(OpenError::InvalidType);
        }
        if !check_crc(buffer) {
            return Err(OpenError::HeaderCrcFailed);
        }
        let mut buf16 = [0_u8; 2];
        let mut buf32 = [0_u8; 4];
        let mut buf64 = [0_u8; 8];
        let mut pos = 8;
        let mut read_u16 = |pos: &mut usize| {
            buf16.copy_from_slice(&buffer[*pos..(*pos + 2)]);
            *pos += 2;
            u16::from_le_bytes(buf16)
        };
        let version = read_u16(&mut pos);
        let flags = read_u16(&mut pos);
        let hash_algorithm = read_u16(&mut pos);
        pos += 2;
        if version != FORMAT_VERSION {
            return Err(OpenError::UnsupportedVersion(version));
        }
        let mut read_u64 = |pos: &mut usize| {
            buf64.copy_from_slice(&buffer[*pos..(*pos + 8)]);
            *pos += 8;
            u64::from_le_bytes(buf64)
        };
        let keys = read_u64(&mut pos);
        let values = read_u64(&mut pos);
        let seed = read_u64(&mut pos);
        let mut sections = [Section::default(); SECTIONS];
        for section in sections.iter_mut() {
            let offset = read_u64(&mut pos);
            let len = read_u64(&mut pos);
            *section = Section::new(offset, len);
        }
        let total_len = read_u64(&mut pos);
        buf32.copy_from_slice(&buffer[pos..(pos + 4)]);
        let body_crc = u32::from_le_bytes(buf32);
        let [hash_params, fingerprints, offsets, key_region, value_region, dictionary] = sections;
        Ok(Self {
            type_id,
            version,
            flags,
            hash_algorithm,
            keys,
            values,
            seed,
            hash_params,
            fingerprints,
            offsets,
            key_region,
            value_region,
            dictionary,
            total_len,
            body_crc,
        })
    }

    /// Check the section layout against the actual artifact length.  After this succeeds every
    /// Section::range() is a valid index into the artifact.
    pub fn validate(&self, artifact_len: usize) -> Result<(), OpenError> {
        if (artifact_len as u64) < self.total_len {
            return Err(OpenError::Truncated);
        }
        if artifact_len as u64 != self.total_len {
            return Err(OpenError::SectionOutOfBounds("artifact length"));
        }
        if self.keys == 0 {
            return Err(OpenError::SectionOutOfBounds("key count"));
        }
        let mut expected_offset = HEADER_SIZE as u64;
        for (name, section) in self.sections() {
            if section.offset != expected_offset {
                return Err(OpenError::SectionOutOfBounds(name));
            }
            expected_offset = section
                .end()
                .filter(|end| *end <= self.total_len)
                .ok_or(OpenError::SectionOutOfBounds(name))?;
        }
        if expected_offset != self.total_len {
            return Err(OpenError::SectionOutOfBounds("artifact length"));
        }
        if Some(self.fingerprints.len) != self.keys.checked_mul(FINGERPRINT_SIZE as u64) {
            return Err(OpenError::SectionOutOfBounds("fingerprint"));
        }
        if Some(self.offsets.len) != self.keys.checked_mul(OFFSET_SIZE as u64) {
            return Err(OpenError::SectionOutOfBounds("offset"));
        }
        if self.has_value_dictionary() == self.dictionary.is_empty() {
            return Err(OpenError::SectionOutOfBounds("dictionary"));
        }
        Ok(())
    }

    /// Format version.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Was the artifact built with a value dictionary?
    pub fn has_value_dictionary(&self) -> bool {
        self.flags & FLAG_VALUE_DICTIONARY != 0
    }

    /// Id of the perfect hash algorithm.
    pub fn hash_algorithm(&self) -> u16 {
        self.hash_algorithm
    }

    /// Number of keys (N).
    pub fn keys(&self) -> u64 {
        self.keys
    }

    /// Number of distinct values (dictionary) or stored values (no dictionary).
    pub fn values(&self) -> u64 {
        self.values
    }

    /// Seed of the perfect hash.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Total artifact length in bytes.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Recorded crc32 of every byte after the header.
    pub fn body_crc(&self) -> u32 {
        self.body_crc
    }

    /// Perfect hash parameters.
    pub fn hash_params(&self) -> Section {
        self.hash_params
    }

    /// Per slot fingerprints.
    pub fn fingerprints(&self) -> Section {
        self.fingerprints
    }

    /// Per slot value offsets.
    pub fn offsets(&self) -> Section {
        self.offsets
    }

    /// Key records.
    pub fn key_region(&self) -> Section {
        self.key_region
    }

    /// Value lists.
    pub fn value_region(&self) -> Section {
        self.value_region
    }

    /// Value dictionary (empty if not used).
    pub fn dictionary(&self) -> Section {
        self.dictionary
    }
}
