//! QPACK field compression (RFC 9204), static table only.
//!
//! We advertise a dynamic table capacity of zero, so every encoded field
//! section starts with a zero Required Insert Count and Base, and any
//! reference into a dynamic table is a decompression failure.

mod huffman;
mod integer;
mod static_table;

use super::Header;
use crate::error::{Error, H3Error};

/// Per-field overhead counted against SETTINGS_MAX_FIELD_SECTION_SIZE
/// (RFC 9114 §4.2.2).
const FIELD_OVERHEAD: u64 = 32;

fn malformed() -> Error {
    Error::Http3(H3Error::QpackDecompressionFailed)
}

/// Append a string literal whose length uses a `prefix`-bit prefix, with
/// `huffman_flag` being the H bit just above the prefix.
fn put_string(s: &[u8], prefix: u8, flags: u8, huffman_flag: u8, out: &mut Vec<u8>) {
    let huff_len = huffman::encoded_len(s);
    if huff_len < s.len() {
        integer::encode(huff_len as u64, prefix, flags | huffman_flag, out);
        huffman::encode(s, out);
    } else {
        integer::encode(s.len() as u64, prefix, flags, out);
        out.extend_from_slice(s);
    }
}

/// Read a string literal at the front of `buf`. Returns the decoded bytes
/// and the bytes consumed.
fn get_string(buf: &[u8], prefix: u8) -> Result<(Vec<u8>, usize), Error> {
    let huffman = buf.first().ok_or_else(malformed)? & (1 << prefix) != 0;
    let (len, n) = integer::decode(buf, prefix)?;
    let len = usize::try_from(len).map_err(|_| malformed())?;
    let raw = buf.get(n..n.checked_add(len).ok_or_else(malformed)?).ok_or_else(malformed)?;

    let s = if huffman {
        let mut out = Vec::with_capacity(len * 8 / 5);
        huffman::decode(raw, &mut out)?;
        out
    } else {
        raw.to_vec()
    };
    Ok((s, n + len))
}

/// Field section encoder.
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode `headers` as a complete field section.
    pub fn encode(&mut self, headers: &[Header]) -> Vec<u8> {
        // Required Insert Count and Base are both zero.
        let mut out = vec![0x00, 0x00];

        for h in headers {
            let name = h.name().to_ascii_lowercase();
            match static_table::find(&name, h.value()) {
                Some(static_table::Match::Full(i)) => {
                    // 1 T=1 index(6)
                    integer::encode(i, 6, 0xc0, &mut out);
                }
                Some(static_table::Match::Name(i)) => {
                    // 0 1 N=0 T=1 index(4), then the value
                    integer::encode(i, 4, 0x50, &mut out);
                    put_string(h.value(), 7, 0x00, 0x80, &mut out);
                }
                None => {
                    // 0 0 1 N=0 H name-length(3), then the value
                    put_string(&name, 3, 0x20, 0x08, &mut out);
                    put_string(h.value(), 7, 0x00, 0x80, &mut out);
                }
            }
        }
        out
    }
}

/// Field section decoder.
#[derive(Debug)]
pub struct Decoder {
    max_field_section_size: u64,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

impl Decoder {
    pub fn new(max_field_section_size: u64) -> Self {
        Self { max_field_section_size }
    }

    /// Decode a field section.
    ///
    /// Fails with `ExcessiveLoad` when the decoded list is larger than the
    /// configured limit, and `QpackDecompressionFailed` for anything
    /// malformed or referring to a dynamic table.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>, Error> {
        let (required_insert_count, mut pos) = integer::decode(block, 8)?;
        if required_insert_count != 0 {
            return Err(malformed());
        }
        let (_delta_base, n) = integer::decode(block.get(pos..).unwrap_or_default(), 7)?;
        pos += n;

        let mut headers = Vec::new();
        let mut size: u64 = 0;

        while let Some(&first) = block.get(pos) {
            let rest = &block[pos..];
            let (name, value, used) = if first & 0x80 != 0 {
                // indexed field line
                if first & 0x40 == 0 {
                    return Err(malformed());
                }
                let (index, used) = integer::decode(rest, 6)?;
                let (name, value) = static_table::get(index).ok_or_else(malformed)?;
                (name.to_vec(), value.to_vec(), used)
            } else if first & 0x40 != 0 {
                // literal with name reference
                if first & 0x10 == 0 {
                    return Err(malformed());
                }
                let (index, used) = integer::decode(rest, 4)?;
                let (name, _) = static_table::get(index).ok_or_else(malformed)?;
                let (value, value_len) = get_string(&rest[used..], 7)?;
                (name.to_vec(), value, used + value_len)
            } else if first & 0x20 != 0 {
                // literal with literal name
                let (name, name_len) = get_string(rest, 3)?;
                let (value, value_len) = get_string(&rest[name_len..], 7)?;
                (name, value, name_len + value_len)
            } else {
                // post-base forms only address the dynamic table
                return Err(malformed());
            };
            pos += used;

            size += name.len() as u64 + value.len() as u64 + FIELD_OVERHEAD;
            if size > self.max_field_section_size {
                return Err(Error::Http3(H3Error::ExcessiveLoad));
            }
            headers.push(Header(name, value));
        }

        Ok(headers)
    }
}
