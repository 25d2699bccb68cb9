//! Packed storage for the value lists of every key.
//!
//! A value list is a varint count followed by count entries.  Without a dictionary each entry is
//! a varint length and the value bytes.  With a dictionary each entry is the varint id of the
//! value in a shared table of distinct values:
//!
//! ```text
//! dictionary: | count (u64) | count x offset (u64) | data: (varint len, bytes)* |
//! ```
//!
//! Dictionary ids are assigned in ascending byte order of the values so two builds of the same
//! associations produce the same bytes.

use crate::error::deserialize::DeserializeError;
use crate::varint::{read_len_prefixed, read_varint, write_len_prefixed, write_varint};
use std::collections::{BTreeSet, HashMap};

/// Builds the value region (and dictionary if enabled) for a new artifact.
pub(crate) struct ValueMapWriter<'v> {
    region: Vec<u8>,
    ids: Option<HashMap<&'v [u8], u64>>,
    stored: u64,
}

impl<'v> ValueMapWriter<'v> {
    /// Writer that stores value bytes inline.
    pub fn new() -> Self {
        Self {
            region: Vec::new(),
            ids: None,
            stored: 0,
        }
    }

    /// Writer that stores ids into a dictionary of distinct.
    pub fn with_dictionary(distinct: &BTreeSet<&'v [u8]>) -> Self {
        let ids = distinct
            .iter()
            .enumerate()
            .map(|(id, value)| (*value, id as u64))
            .collect();
        Self {
            region: Vec::new(),
            ids: Some(ids),
            stored: 0,
        }
    }

    /// Serialize an ordered value list, returns the (offset, length) of the list in the region.
    pub fn append<'a, I>(&mut self, values: I) -> (u64, u64)
    where
        I: ExactSizeIterator<Item = &'a [u8]>,
    {
        let offset = self.region.len() as u64;
        write_varint(&mut self.region, values.len() as u64);
        for value in values {
            match &self.ids {
                Some(ids) => {
                    // Every value was handed to with_dictionary().
                    let id = *ids.get(value).expect("value missing from the dictionary");
                    write_varint(&mut self.region, id);
                }
                None => write_len_prefixed(&mut self.region, value),
            }
            self.stored += 1;
        }
        (offset, self.region.len() as u64 - offset)
    }

    /// Values stored so far (counting repeats).
    pub fn stored(&self) -> u64 {
        self.stored
    }

    /// Consume the writer, returns the value region.
    pub fn into_region(self) -> Vec<u8> {
        self.region
    }
}

/// Encode the dictionary section for distinct values (in id order).
pub(crate) fn write_dictionary<'a, I>(distinct: I, count: usize) -> Vec<u8>
where
    I: Iterator<Item = &'a [u8]>,
{
    let table_len = 8 + count * 8;
    let mut buffer = vec![0_u8; table_len];
    buffer[0..8].copy_from_slice(&(count as u64).to_le_bytes());
    let mut data = Vec::new();
    for (id, value) in distinct.enumerate() {
        let pos = 8 + id * 8;
        buffer[pos..(pos + 8)].copy_from_slice(&(data.len() as u64).to_le_bytes());
        write_len_prefixed(&mut data, value);
    }
    buffer.extend_from_slice(&data);
    buffer
}

/// Read only view of a value dictionary.
#[derive(Debug, Copy, Clone)]
pub struct ValueDictionary<'a> {
    table: &'a [u8],
    data: &'a [u8],
    count: u64,
}

impl<'a> ValueDictionary<'a> {
    /// Wrap the dictionary section.  Checks the table fits, entries are checked on access.
    pub fn new(section: &'a [u8]) -> Result<Self, DeserializeError> {
        if section.len() < 8 {
            return Err(DeserializeError::new("dictionary too short"));
        }
        let mut buf64 = [0_u8; 8];
        buf64.copy_from_slice(&section[0..8]);
        let count = u64::from_le_bytes(buf64);
        let table_end = count
            .checked_mul(8)
            .and_then(|len| len.checked_add(8))
            .filter(|end| *end <= section.len() as u64)
            .ok_or_else(|| DeserializeError::new("dictionary table past end"))?
            as usize;
        Ok(Self {
            table: &section[8..table_end],
            data: &section[table_end..],
            count,
        })
    }

    /// Number of distinct values.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Is the dictionary empty?
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Value for id.
    pub fn get(&self, id: u64) -> Result<&'a [u8], DeserializeError> {
        if id >= self.count {
            return Err(DeserializeError::new("dictionary id out of range"));
        }
        let pos = id as usize * 8;
        let mut buf64 = [0_u8; 8];
        buf64.copy_from_slice(&self.table[pos..(pos + 8)]);
        let offset = u64::from_le_bytes(buf64);
        if offset >= self.data.len() as u64 {
            return Err(DeserializeError::new("dictionary offset past end"));
        }
        let (value, _) = read_len_prefixed(&self.data[offset as usize..])?;
        Ok(value)
    }

    /// Iterate the distinct values in id (byte) order.
    pub fn iter(&self) -> impl Iterator<Item = Result<&'a [u8], DeserializeError>> + 'a {
        let dictionary = *self;
        (0..self.count).map(move |id| dictionary.get(id))
    }
}

/// Read only view of the value region.
#[derive(Debug, Copy, Clone)]
pub struct ValueMap<'a> {
    region: &'a [u8],
    dictionary: Option<ValueDictionary<'a>>,
}

impl<'a> ValueMap<'a> {
    /// View of region, decoding ids through dictionary if present.
    pub fn new(region: &'a [u8], dictionary: Option<ValueDictionary<'a>>) -> Self {
        Self { region, dictionary }
    }

    /// Value list stored at offset.  The whole list is checked before it is returned so the
    /// iterator itself can not fail, nothing is copied.
    pub fn read(&self, offset: u64) -> Result<ValueIter<'a>, DeserializeError> {
        let list = self.list_at(offset)?;
        let (count, used) = read_varint(list)?;
        let mut pos = used;
        for _ in 0..count {
            let entry = list
                .get(pos..)
                .ok_or_else(|| DeserializeError::new("value list past end"))?;
            pos += match &self.dictionary {
                Some(dictionary) => {
                    let (id, used) = read_varint(entry)?;
                    dictionary.get(id)?;
                    used
                }
                None => read_len_prefixed(entry)?.1,
            };
        }
        Ok(ValueIter {
            entries: &list[used..pos],
            dictionary: self.dictionary,
            remaining: count as usize,
        })
    }

    /// Number of values stored at offset, reads only the count.
    pub fn count(&self, offset: u64) -> Result<u64, DeserializeError> {
        Ok(read_varint(self.list_at(offset)?)?.0)
    }

    fn list_at(&self, offset: u64) -> Result<&'a [u8], DeserializeError> {
        if offset >= self.region.len() as u64 {
            return Err(DeserializeError::new("value offset past end"));
        }
        Ok(&self.region[offset as usize..])
    }
}

/// Lazy iterator over one key's values.  Cloning restarts from the current position, so a fresh
/// clone taken before iterating can be replayed any number of times.
#[derive(Debug, Clone)]
pub struct ValueIter<'a> {
    entries: &'a [u8],
    dictionary: Option<ValueDictionary<'a>>,
    remaining: usize,
}

impl<'a> Iterator for ValueIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        // Entries were validated by ValueMap::read(), a failure here means a bug so just end.
        let (value, used) = match &self.dictionary {
            Some(dictionary) => {
                let (id, used) = read_varint(self.entries).ok()?;
                (dictionary.get(id).ok()?, used)
            }
            None => read_len_prefixed(self.entries).ok()?,
        };
        self.entries = &self.entries[used..];
        self.remaining -= 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> ExactSizeIterator for ValueIter<'a> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists() -> Vec<Vec<&'static [u8]>> {
        vec![
            vec![b"x", b"y"],
            vec![b"y"],
            vec![],
            vec![b"a much longer value that is not tiny", b"x"],
        ]
    }

    #[test]
    fn test_inline_values() {
        let mut writer = ValueMapWriter::new();
        let mut offsets = Vec::new();
        for list in lists() {
            offsets.push(writer.append(list.iter().copied()));
        }
        assert_eq!(writer.stored(), 5);
        // Offsets are contiguous.
        assert_eq!(offsets[0], (0, 5));
        assert_eq!(offsets[1].0, 5);
        let region = writer.into_region();
        let map = ValueMap::new(&region, None);
        for ((offset, _), list) in offsets.iter().zip(lists()) {
            let iter = map.read(*offset).unwrap();
            assert_eq!(iter.len(), list.len());
            let replay = iter.clone();
            assert_eq!(iter.collect::<Vec<_>>(), list);
            assert_eq!(replay.collect::<Vec<_>>(), list);
            assert_eq!(map.count(*offset).unwrap(), list.len() as u64);
        }
        assert!(map.read(region.len() as u64).is_err());
    }

    #[test]
    fn test_dictionary_values() {
        let distinct: BTreeSet<&[u8]> = lists().into_iter().flatten().collect();
        let mut writer = ValueMapWriter::with_dictionary(&distinct);
        let offsets: Vec<(u64, u64)> = lists()
            .iter()
            .map(|list| writer.append(list.iter().copied()))
            .collect();
        let region = writer.into_region();
        let dictionary_bytes = write_dictionary(distinct.iter().copied(), distinct.len());
        let dictionary = ValueDictionary::new(&dictionary_bytes).unwrap();
        assert_eq!(dictionary.len(), 3);
        assert_eq!(dictionary.get(0).unwrap(), b"a much longer value that is not tiny");
        assert!(dictionary.get(3).is_err());
        let all: Vec<&[u8]> = dictionary.iter().map(|v| v.unwrap()).collect();
        assert_eq!(all, distinct.iter().copied().collect::<Vec<_>>());

        let map = ValueMap::new(&region, Some(dictionary));
        for ((offset, len), list) in offsets.iter().zip(lists()) {
            // One byte count plus one byte per id.
            assert_eq!(*len as usize, 1 + list.len());
            assert_eq!(map.read(*offset).unwrap().collect::<Vec<_>>(), list);
        }
    }

    #[test]
    fn test_corrupt_lists() {
        let mut writer = ValueMapWriter::new();
        writer.append([b"abc".as_slice()].into_iter());
        let mut region = writer.into_region();
        // Claim two values, only one present.
        region[0] = 2;
        let map = ValueMap::new(&region, None);
        assert!(map.read(0).is_err());
        // Bad dictionary id.
        let distinct: BTreeSet<&[u8]> = [b"v".as_slice()].into_iter().collect();
        let dictionary_bytes = write_dictionary(distinct.iter().copied(), 1);
        let dictionary = ValueDictionary::new(&dictionary_bytes).unwrap();
        let map = ValueMap::new(&[1, 7], Some(dictionary));
        assert!(map.read(0).is_err());
        assert!(ValueDictionary::new(&[9, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
