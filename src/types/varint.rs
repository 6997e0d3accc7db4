//! LEB128 variable-length integers.
//!
//! Used by the node codec to prefix variable-size keys and values.

/// Maximum encoded length of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `buf` as a varint.
///
/// Each byte carries 7 bits of payload; the high bit marks that more
/// bytes follow.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a varint from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// input is truncated or longer than any u64 encoding.
pub fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;

    for (i, &byte) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        let payload = (byte & 0x7F) as u64;
        if i == MAX_VARINT_LEN - 1 && payload > 1 {
            return None;
        }
        value |= payload << (7 * i);

        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }

    None
}

/// Number of bytes `put_varint` emits for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
