/// QUIC variable-length integers (RFC 9000 §16).
///
/// The two most significant bits of the first byte give the encoded length:
/// `00` = 1 byte, `01` = 2, `10` = 4, `11` = 8.
use crate::error::Error;

/// Largest value a varint can hold (2^62 - 1).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

pub const fn varint_len(value: u64) -> usize {
    if value <= 63 {
        1
    } else if value <= 16383 {
        2
    } else if value <= 1_073_741_823 {
        4
    } else {
        8
    }
}

/// Length of a varint given its first byte.
pub const fn parse_varint_len(first: u8) -> usize {
    1 << (first >> 6)
}

/// Decode a varint from the front of `buf`, returning `(value, consumed)`.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), Error> {
    let first = *buf.first().ok_or(Error::BufferTooShort { needed: 1 })?;
    let len = parse_varint_len(first);
    let raw = buf
        .get(..len)
        .ok_or(Error::BufferTooShort { needed: len })?;

    let mut value = u64::from(first & 0x3f);
    for b in &raw[1..] {
        value = (value << 8) | u64::from(*b);
    }
    Ok((value, len))
}

/// Encode `value` with its minimal length, returning the bytes written.
pub fn encode_varint(value: u64, buf: &mut [u8]) -> Result<usize, Error> {
    encode_varint_with_len(value, varint_len(value), buf)
}

/// Encode `value` using exactly `len` bytes (1, 2, 4 or 8).
///
/// Long headers reserve the Length field before the payload size is known,
/// so they need a fixed-width encoding.
pub fn encode_varint_with_len(value: u64, len: usize, buf: &mut [u8]) -> Result<usize, Error> {
    if value > MAX_VARINT || varint_len(value) > len {
        return Err(Error::Transport(
            crate::error::TransportError::InternalError,
        ));
    }
    let out = buf
        .get_mut(..len)
        .ok_or(Error::BufferTooShort { needed: len })?;

    let tag: u8 = match len {
        1 => 0x00,
        2 => 0x40,
        4 => 0x80,
        8 => 0xc0,
        _ => return Err(Error::Transport(crate::error::TransportError::InternalError)),
    };
    let bytes = value.to_be_bytes();
    out.copy_from_slice(&bytes[8 - len..]);
    out[0] |= tag;
    Ok(len)
}

/// Append `value` to a growable buffer.
pub fn push_varint(value: u64, out: &mut Vec<u8>) {
    let mut tmp = [0u8; 8];
    // values above MAX_VARINT are clamped; callers only pass protocol fields
    let n = encode_varint(value.min(MAX_VARINT), &mut tmp).unwrap_or(0);
    out.extend_from_slice(&tmp[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: u64, expected_len: usize) {
        let mut buf = [0u8; 8];
        let written = encode_varint(v, &mut buf).unwrap();
        assert_eq!(written, expected_len, "length for {v}");
        assert_eq!(decode_varint(&buf[..written]).unwrap(), (v, expected_len));
    }

    #[test]
    fn length_classes() {
        roundtrip(0, 1);
        roundtrip(63, 1);
        roundtrip(64, 2);
        roundtrip(16383, 2);
        roundtrip(16384, 4);
        roundtrip(1_073_741_823, 4);
        roundtrip(1_073_741_824, 8);
        roundtrip(MAX_VARINT, 8);
    }

    /// RFC 9000 §A.1 sample encodings.
    #[test]
    fn rfc_vectors() {
        let cases: [(&[u8], u64); 4] = [
            (&hex_literal::hex!("c2197c5eff14e88c"), 151_288_809_941_952_652),
            (&hex_literal::hex!("9d7f3e7d"), 494_878_333),
            (&hex_literal::hex!("7bbd"), 15293),
            (&hex_literal::hex!("25"), 37),
        ];
        for (wire, value) in cases {
            assert_eq!(decode_varint(wire).unwrap(), (value, wire.len()));
        }
        // non-minimal encodings are legal on the wire
        assert_eq!(decode_varint(&hex_literal::hex!("4025")).unwrap(), (37, 2));
    }

    #[test]
    fn fixed_width_encoding() {
        let mut buf = [0u8; 2];
        assert_eq!(encode_varint_with_len(37, 2, &mut buf).unwrap(), 2);
        assert_eq!(buf, [0x40, 0x25]);
        assert!(encode_varint_with_len(20_000, 2, &mut buf).is_err());
    }

    #[test]
    fn truncated_input() {
        assert_eq!(
            decode_varint(&[]),
            Err(Error::BufferTooShort { needed: 1 })
        );
        assert_eq!(
            decode_varint(&[0x80, 0x01]),
            Err(Error::BufferTooShort { needed: 4 })
        );
    }

    #[test]
    fn rejects_out_of_range() {
        let mut buf = [0u8; 8];
        assert!(encode_varint(MAX_VARINT + 1, &mut buf).is_err());
        let mut short = [0u8; 1];
        assert_eq!(
            encode_varint(16384, &mut short),
            Err(Error::BufferTooShort { needed: 4 })
        );
    }

    #[test]
    fn push_appends() {
        let mut v = vec![0xaa];
        push_varint(15293, &mut v);
        assert_eq!(v, [0xaa, 0x7b, 0xbd]);
    }
}
