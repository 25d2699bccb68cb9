//! Unsigned LEB128 variable length integers.  Used for counts, lengths and dictionary ids in the
//! key and value regions so small numbers (the common case) take a single byte.

use crate::error::deserialize::DeserializeError;

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Append value to buffer as a varint.
pub fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buffer.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

/// Number of bytes write_varint() will use for value.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Decode a varint from the start of buffer.
/// Returns the value and the number of bytes consumed.
pub fn read_varint(buffer: &[u8]) -> Result<(u64, usize), DeserializeError> {
    let mut value = 0_u64;
    for (i, byte) in buffer.iter().take(MAX_VARINT_LEN).enumerate() {
        let low = (*byte & 0x7f) as u64;
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(DeserializeError::new("varint overflows u64"));
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && *byte == 0 {
                return Err(DeserializeError::new("overlong varint"));
            }
            return Ok((value, i + 1));
        }
    }
    if buffer.len() < MAX_VARINT_LEN {
        Err(DeserializeError::new("truncated varint"))
    } else {
        Err(DeserializeError::new("varint too long"))
    }
}

/// Decode a varint length prefix followed by that many bytes.
/// Returns the bytes and the total number of bytes consumed.
pub fn read_len_prefixed(buffer: &[u8]) -> Result<(&[u8], usize), DeserializeError> {
    let (len, used) = read_varint(buffer)?;
    let end = (used as u64)
        .checked_add(len)
        .filter(|end| *end <= buffer.len() as u64)
        .ok_or_else(|| DeserializeError::new("length prefix past end of region"))?
        as usize;
    Ok((&buffer[used..end], end))
}

/// Append a varint length prefix and bytes.
pub fn write_len_prefixed(buffer: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buffer, bytes.len() as u64);
    buffer.extend_from_slice(bytes);
}
