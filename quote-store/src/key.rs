//! Timestamp keys: 8-byte big-endian nanoseconds since the epoch.
//!
//! For non-negative timestamps, byte-lexicographic order of the keys equals chronological order.
use byteorder::{BigEndian, ByteOrder};

pub const KEY_LEN: usize = 8;

pub type TimestampKey = [u8; KEY_LEN];

pub fn encode_key(nanos: i64) -> TimestampKey {
    let mut key = [0u8; KEY_LEN];
    BigEndian::write_u64(&mut key, nanos as u64);
    key
}

/// Decodes a stored key. Returns `None` if `bytes` is not exactly eight bytes long.
pub fn decode_key(bytes: &[u8]) -> Option<i64> {
    if bytes.len() != KEY_LEN {
        return None;
    }
    Some(BigEndian::read_u64(bytes) as i64)
}
