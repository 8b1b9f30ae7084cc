//! Prefixed integers (RFC 7541 §5.1), as used by QPACK field lines.
//!
//! The low `prefix` bits of the first byte hold the value, or all ones when
//! it does not fit; the remainder follows in 7-bit groups, least
//! significant first, with the high bit marking continuation.

use crate::error::{Error, H3Error};

/// Longest continuation accepted; 9 groups of 7 bits covers a u62.
const MAX_CONTINUATION: usize = 9;

/// Append `value` using a `prefix`-bit prefix. `flags` supplies the bits
/// above the prefix in the first byte.
pub fn encode(value: u64, prefix: u8, flags: u8, out: &mut Vec<u8>) {
    debug_assert!((1..=8).contains(&prefix));
    let max = (1u64 << prefix) - 1;

    if value < max {
        out.push(flags | value as u8);
        return;
    }

    out.push(flags | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

/// Decode a prefixed integer, returning `(value, consumed)`.
pub fn decode(buf: &[u8], prefix: u8) -> Result<(u64, usize), Error> {
    debug_assert!((1..=8).contains(&prefix));
    let malformed = Error::Http3(H3Error::QpackDecompressionFailed);

    let first = *buf.first().ok_or(malformed.clone())?;
    let max = (1u64 << prefix) - 1;
    let mut value = u64::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }

    for (i, &b) in buf[1..].iter().take(MAX_CONTINUATION).enumerate() {
        let group = u64::from(b & 0x7f) << (7 * i as u32);
        value = value.checked_add(group).ok_or(malformed.clone())?;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
    }
    Err(malformed)
}
