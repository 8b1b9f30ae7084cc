//! QUIC packet headers (RFC 9000 §17).
//!
//! Parsing stops at the end of the fields that are not header protected: the
//! Length field and packet number of long headers are read by the receive
//! path once protection is removed.

pub mod number;
pub mod protection;
pub mod retry;

use crate::cid::{ConnectionId, MAX_CONN_ID_LEN};
use crate::error::Error;
use crate::wire::{Reader, Writer};

/// QUIC version 1 (RFC 9000).
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Smallest UDP payload carrying a client Initial (RFC 9000 §14.1).
pub const MIN_CLIENT_INITIAL_LEN: usize = 1200;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;
const TYPE_MASK: u8 = 0x30;
const PKT_NUM_MASK: u8 = 0x03;

/// Packet number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial,
    Handshake,
    Application,
}

impl Epoch {
    pub const ALL: [Epoch; 3] = [Epoch::Initial, Epoch::Handshake, Epoch::Application];

    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Initial,
    Retry,
    Handshake,
    ZeroRTT,
    VersionNegotiation,
    Short,
}

impl Type {
    /// Packet number space of an encrypted packet type.
    pub fn to_epoch(self) -> Result<Epoch, Error> {
        match self {
            Type::Initial => Ok(Epoch::Initial),
            Type::Handshake => Ok(Epoch::Handshake),
            Type::ZeroRTT | Type::Short => Ok(Epoch::Application),
            _ => Err(Error::InvalidPacket),
        }
    }

    fn long_bits(self) -> Result<u8, Error> {
        match self {
            Type::Initial => Ok(0x00),
            Type::ZeroRTT => Ok(0x01),
            Type::Handshake => Ok(0x02),
            Type::Retry => Ok(0x03),
            _ => Err(Error::InvalidPacket),
        }
    }
}

/// Whether this implementation speaks `version`.
pub fn version_is_supported(version: u32) -> bool {
    version == PROTOCOL_VERSION
}

/// A parsed packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub ty: Type,
    /// Zero for short headers.
    pub version: u32,
    pub dcid: ConnectionId,
    /// Empty for short headers.
    pub scid: ConnectionId,
    /// Filled in once header protection is removed.
    pub pkt_num: u64,
    pub pkt_num_len: usize,
    /// Initial (supported versions only) and Retry tokens.
    pub token: Option<Vec<u8>>,
    /// Versions listed by a Version Negotiation packet.
    pub versions: Option<Vec<u32>>,
    pub key_phase: bool,
}

impl Header {
    /// Parse the unprotected part of a header at the front of `buf`.
    ///
    /// `dcid_len` is the connection ID length expected in short headers.
    pub fn from_slice(buf: &[u8], dcid_len: usize) -> Result<Header, Error> {
        let mut r = Reader::new(buf);
        Header::from_reader(&mut r, dcid_len)
    }

    pub(crate) fn from_reader(r: &mut Reader<'_>, dcid_len: usize) -> Result<Header, Error> {
        let first = r.get_u8()?;

        if first & FORM_BIT == 0 {
            let dcid = ConnectionId::from_slice(r.get_bytes(dcid_len)?)?;
            return Ok(Header {
                ty: Type::Short,
                version: 0,
                dcid,
                scid: ConnectionId::empty(),
                pkt_num: 0,
                pkt_num_len: 0,
                token: None,
                versions: None,
                key_phase: false,
            });
        }

        let version = r.get_u32()?;
        let ty = if version == 0 {
            Type::VersionNegotiation
        } else {
            match (first & TYPE_MASK) >> 4 {
                0x00 => Type::Initial,
                0x01 => Type::ZeroRTT,
                0x02 => Type::Handshake,
                _ => Type::Retry,
            }
        };

        let dcid = r.get_bytes_with_u8_length()?;
        let scid = r.get_bytes_with_u8_length()?;
        if dcid.len() > MAX_CONN_ID_LEN || scid.len() > MAX_CONN_ID_LEN {
            return Err(Error::InvalidPacket);
        }

        let mut token = None;
        let mut versions = None;
        match ty {
            Type::Initial if version_is_supported(version) => {
                token = Some(r.get_bytes_with_varint_length()?.to_vec());
            }
            Type::Retry => {
                let rest = r.rest();
                let Some(token_len) = rest.len().checked_sub(retry::TAG_LEN) else {
                    return Err(Error::InvalidPacket);
                };
                token = Some(rest[..token_len].to_vec());
            }
            Type::VersionNegotiation => {
                let mut list = Vec::new();
                while r.cap() >= 4 {
                    list.push(r.get_u32()?);
                }
                versions = Some(list);
            }
            _ => {}
        }

        Ok(Header {
            ty,
            version,
            dcid: ConnectionId::from_slice(dcid)?,
            scid: ConnectionId::from_slice(scid)?,
            pkt_num: 0,
            pkt_num_len: 0,
            token,
            versions,
            key_phase: false,
        })
    }

    /// Write everything up to (not including) the Length field of a long
    /// header, or up to the packet number of a short header.
    pub(crate) fn to_writer(&self, w: &mut Writer<'_>) -> Result<(), Error> {
        let pn_bits = (self.pkt_num_len.saturating_sub(1) as u8) & PKT_NUM_MASK;

        if self.ty == Type::Short {
            let mut first = FIXED_BIT | pn_bits;
            if self.key_phase {
                first |= KEY_PHASE_BIT;
            }
            w.put_u8(first)?;
            return w.put_bytes(&self.dcid);
        }

        let first = FORM_BIT | FIXED_BIT | (self.ty.long_bits()? << 4) | pn_bits;
        w.put_u8(first)?;
        w.put_u32(self.version)?;
        w.put_u8(self.dcid.len() as u8)?;
        w.put_bytes(&self.dcid)?;
        w.put_u8(self.scid.len() as u8)?;
        w.put_bytes(&self.scid)?;

        if self.ty == Type::Initial {
            let token = self.token.as_deref().unwrap_or_default();
            w.put_varint(token.len() as u64)?;
            w.put_bytes(token)?;
        }
        Ok(())
    }
}

/// A grease version of the form `0x?a?a?a?a`, derived from `seed`.
fn grease_version(seed: &[u8]) -> u32 {
    let nibble = u32::from(seed.first().copied().unwrap_or(0) & 0xf0);
    (nibble * 0x0101_0101) | 0x0a0a_0a0a
}

/// Write a Version Negotiation packet in reply to a packet carrying
/// source ID `scid` and destination ID `dcid`.
pub fn negotiate_version(scid: &[u8], dcid: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let mut w = Writer::new(out);
    w.put_u8(FORM_BIT | FIXED_BIT)?;
    w.put_u32(0)?;
    w.put_u8(scid.len() as u8)?;
    w.put_bytes(scid)?;
    w.put_u8(dcid.len() as u8)?;
    w.put_bytes(dcid)?;
    w.put_u32(grease_version(dcid))?;
    w.put_u32(PROTOCOL_VERSION)?;
    Ok(w.off())
}

/// Write a Retry packet in reply to a client Initial carrying source ID
/// `scid` and destination ID `dcid`. The client is told to use `new_scid`
/// and echo `token`.
pub fn retry(
    scid: &[u8],
    dcid: &[u8],
    new_scid: &[u8],
    token: &[u8],
    version: u32,
    out: &mut [u8],
) -> Result<usize, Error> {
    if !version_is_supported(version) {
        return Err(Error::UnknownVersion);
    }

    let hdr = Header {
        ty: Type::Retry,
        version,
        dcid: ConnectionId::from_slice(scid)?,
        scid: ConnectionId::from_slice(new_scid)?,
        pkt_num: 0,
        pkt_num_len: 0,
        token: None,
        versions: None,
        key_phase: false,
    };

    let mut w = Writer::new(out);
    hdr.to_writer(&mut w)?;
    w.put_bytes(token)?;
    let len = w.off();

    let tag = retry::integrity_tag(dcid, &out[..len])?;
    let end = len + retry::TAG_LEN;
    out.get_mut(len..end)
        .ok_or(Error::BufferTooShort { needed: end })?
        .copy_from_slice(&tag);
    Ok(end)
}
