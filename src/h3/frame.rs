//! HTTP/3 frames (RFC 9114 §7).
//!
//! ```text
//! Frame {
//!   Type (i),
//!   Length (i),
//!   Payload (..),
//! }
//! ```
//!
//! DATA payloads are streamed by the connection, so besides whole-frame
//! decoding this module exposes [`parse_header`] for reading just the type
//! and length.

use crate::error::{Error, H3Error};
use crate::varint::{decode_varint, push_varint, varint_len};

pub const DATA: u64 = 0x00;
pub const HEADERS: u64 = 0x01;
pub const CANCEL_PUSH: u64 = 0x03;
pub const SETTINGS: u64 = 0x04;
pub const PUSH_PROMISE: u64 = 0x05;
pub const GOAWAY: u64 = 0x07;
pub const MAX_PUSH_ID: u64 = 0x0d;

/// SETTINGS identifiers that belong to HTTP/2 and must not appear
/// (RFC 9114 §7.2.4.1).
const RESERVED_H2_SETTINGS: [u64; 4] = [0x02, 0x03, 0x04, 0x05];

/// HTTP/3 frame, borrowing its payload from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Data(&'a [u8]),
    /// QPACK field section.
    Headers(&'a [u8]),
    CancelPush(u64),
    /// Raw identifier/value pairs in wire order.
    Settings(Vec<(u64, u64)>),
    PushPromise { push_id: u64, field_section: &'a [u8] },
    GoAway(u64),
    MaxPushId(u64),
    /// Reserved or unknown type; its payload is skipped.
    Unknown(u64),
}

fn frame_error() -> Error {
    Error::Http3(H3Error::FrameError)
}

/// Read a frame's type and payload length.
///
/// Returns `None` until the whole header is available, otherwise
/// `(type, payload_len, header_len)`.
pub fn parse_header(buf: &[u8]) -> Option<(u64, u64, usize)> {
    let (ty, ty_len) = decode_varint(buf).ok()?;
    let (len, len_len) = decode_varint(&buf[ty_len..]).ok()?;
    Some((ty, len, ty_len + len_len))
}

/// A payload that must be exactly one varint.
fn single_varint(payload: &[u8]) -> Result<u64, Error> {
    match decode_varint(payload) {
        Ok((v, n)) if n == payload.len() => Ok(v),
        _ => Err(frame_error()),
    }
}

fn parse_settings(mut payload: &[u8]) -> Result<Vec<(u64, u64)>, Error> {
    let mut settings: Vec<(u64, u64)> = Vec::new();
    while !payload.is_empty() {
        let (id, n) = decode_varint(payload).map_err(|_| frame_error())?;
        payload = &payload[n..];
        let (value, n) = decode_varint(payload).map_err(|_| frame_error())?;
        payload = &payload[n..];

        if RESERVED_H2_SETTINGS.contains(&id) || settings.iter().any(|&(seen, _)| seen == id) {
            return Err(Error::Http3(H3Error::SettingsError));
        }
        settings.push((id, value));
    }
    Ok(settings)
}

impl<'a> Frame<'a> {
    /// Interpret a complete payload of type `ty`.
    pub fn from_payload(ty: u64, payload: &'a [u8]) -> Result<Self, Error> {
        Ok(match ty {
            DATA => Frame::Data(payload),
            HEADERS => Frame::Headers(payload),
            CANCEL_PUSH => Frame::CancelPush(single_varint(payload)?),
            SETTINGS => Frame::Settings(parse_settings(payload)?),
            PUSH_PROMISE => {
                let (push_id, n) = decode_varint(payload).map_err(|_| frame_error())?;
                Frame::PushPromise { push_id, field_section: &payload[n..] }
            }
            GOAWAY => Frame::GoAway(single_varint(payload)?),
            MAX_PUSH_ID => Frame::MaxPushId(single_varint(payload)?),
            _ => Frame::Unknown(ty),
        })
    }

    /// Decode one whole frame from the front of `buf`, returning it and the
    /// bytes consumed.
    pub fn decode(buf: &'a [u8]) -> Result<(Self, usize), Error> {
        let (ty, len, hdr) = parse_header(buf).ok_or(Error::BufferTooShort { needed: 2 })?;
        let total = usize::try_from(len)
            .ok()
            .and_then(|len| len.checked_add(hdr))
            .ok_or_else(frame_error)?;
        let payload = buf.get(hdr..total).ok_or(Error::BufferTooShort { needed: total })?;
        Ok((Frame::from_payload(ty, payload)?, total))
    }

    /// Append the encoded frame. `Unknown` encodes as nothing.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let (ty, body): (u64, Vec<u8>) = match self {
            Frame::Data(p) => (DATA, p.to_vec()),
            Frame::Headers(p) => (HEADERS, p.to_vec()),
            Frame::CancelPush(id) => (CANCEL_PUSH, varint_bytes(*id)),
            Frame::Settings(pairs) => {
                let mut body = Vec::new();
                for &(id, value) in pairs {
                    push_varint(id, &mut body);
                    push_varint(value, &mut body);
                }
                (SETTINGS, body)
            }
            Frame::PushPromise { push_id, field_section } => {
                let mut body = varint_bytes(*push_id);
                body.extend_from_slice(field_section);
                (PUSH_PROMISE, body)
            }
            Frame::GoAway(id) => (GOAWAY, varint_bytes(*id)),
            Frame::MaxPushId(id) => (MAX_PUSH_ID, varint_bytes(*id)),
            Frame::Unknown(_) => return,
        };
        push_varint(ty, out);
        push_varint(body.len() as u64, out);
        out.extend_from_slice(&body);
    }
}

fn varint_bytes(v: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_len(v));
    push_varint(v, &mut out);
    out
}

/// Type and length of a DATA frame carrying `len` bytes.
pub fn data_header(len: usize, out: &mut Vec<u8>) {
    push_varint(DATA, out);
    push_varint(len as u64, out);
}

/// Bytes of DATA framing needed in front of a `len`-byte payload.
pub fn data_header_len(len: usize) -> usize {
    varint_len(DATA) + varint_len(len as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn settings_wire_form() {
        let mut out = Vec::new();
        Frame::Settings(vec![(0x06, 16384), (0x01, 0), (0x07, 0)]).encode(&mut out);
        assert_eq!(out, hex!("04 09 06 80004000 01 00 07 00"));

        let (frame, used) = Frame::decode(&out).unwrap();
        assert_eq!(used, out.len());
        assert_eq!(frame, Frame::Settings(vec![(0x06, 16384), (0x01, 0), (0x07, 0)]));
    }

    #[test]
    fn settings_rejects_h2_ids_and_duplicates() {
        let err = Err(Error::Http3(H3Error::SettingsError));
        assert_eq!(Frame::from_payload(SETTINGS, &hex!("02 00")), err);
        assert_eq!(Frame::from_payload(SETTINGS, &hex!("06 01 06 02")), err);
        assert_eq!(Frame::from_payload(SETTINGS, &hex!("06")), Err(frame_error()));
    }

    #[test]
    fn incomplete_frames_report_needed() {
        // HEADERS of 4 bytes with only 2 present
        assert_eq!(Frame::decode(&hex!("01 04 00 00")), Err(Error::BufferTooShort { needed: 6 }));
        assert!(parse_header(&hex!("40")).is_none());
        assert_eq!(parse_header(&hex!("00 4010")), Some((DATA, 16, 3)));
    }

    #[test]
    fn goaway_must_be_one_varint() {
        assert_eq!(Frame::decode(&hex!("07 01 04")).unwrap(), (Frame::GoAway(4), 3));
        assert_eq!(Frame::from_payload(GOAWAY, &hex!("04 00")), Err(frame_error()));
        assert_eq!(Frame::from_payload(GOAWAY, &[]), Err(frame_error()));
    }

    #[test]
    fn unknown_types_are_skipped_whole() {
        // reserved grease type 0x21 with a 3 byte payload, then DATA
        let buf = hex!("21 03 aa bb cc 00 01 7a");
        let (frame, used) = Frame::decode(&buf).unwrap();
        assert_eq!(frame, Frame::Unknown(0x21));
        assert_eq!(Frame::decode(&buf[used..]).unwrap(), (Frame::Data(b"z"), 3));
    }

    #[test]
    fn data_header_matches_frame_encoding() {
        let body = [0u8; 100];
        let mut framed = Vec::new();
        Frame::Data(&body).encode(&mut framed);
        let mut hdr = Vec::new();
        data_header(body.len(), &mut hdr);
        assert_eq!(&framed[..hdr.len()], &hdr[..]);
        assert_eq!(data_header_len(body.len()), 3);
    }
}
