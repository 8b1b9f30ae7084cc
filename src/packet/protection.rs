//! Packet and header protection (RFC 9001 §5.3-5.4), using the keys the
//! TLS engine hands out.

use rustls::quic::DirectionalKeys;

use super::number::{decode_pn, truncate_pn};
use crate::error::Error;

/// Bytes of packet number assumed when sampling for header protection.
const SAMPLE_OFFSET: usize = 4;

/// Result of opening a protected packet in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub pn: u64,
    pub pn_len: usize,
    /// First byte with protection removed.
    pub first: u8,
    /// Length of the plaintext payload, which starts at `pn_off + pn_len`.
    pub payload_len: usize,
}

/// Remove header and packet protection from `pkt`.
///
/// `pkt` spans exactly one packet; `pn_off` is where its packet number
/// starts and `largest_pn` the largest packet number received so far in the
/// packet number space.
pub fn open(
    pkt: &mut [u8],
    pn_off: usize,
    largest_pn: Option<u64>,
    keys: &DirectionalKeys,
) -> Result<Opened, Error> {
    let sample_len = keys.header.sample_len();
    let sample_start = pn_off + SAMPLE_OFFSET;
    let sample_end = sample_start + sample_len;
    if pkt.len() < sample_end {
        return Err(Error::InvalidPacket);
    }

    let mut sample = [0u8; 32];
    let sample = &mut sample[..sample_len];
    sample.copy_from_slice(&pkt[sample_start..sample_end]);

    let (head, rest) = pkt.split_at_mut(pn_off);
    keys.header
        .decrypt_in_place(sample, &mut head[0], &mut rest[..SAMPLE_OFFSET])
        .map_err(|_| Error::CryptoFail)?;

    let first = pkt[0];
    let pn_len = usize::from(first & 0x03) + 1;
    let mut truncated = 0u64;
    for b in &pkt[pn_off..pn_off + pn_len] {
        truncated = (truncated << 8) | u64::from(*b);
    }
    let pn = decode_pn(truncated, pn_len, largest_pn);

    let (header, payload) = pkt.split_at_mut(pn_off + pn_len);
    let plain = keys
        .packet
        .decrypt_in_place(pn, header, payload)
        .map_err(|_| Error::CryptoFail)?;

    Ok(Opened { pn, pn_len, first, payload_len: plain.len() })
}

/// Protect a packet in place.
///
/// `pkt[..pn_off]` holds the header, followed by `pn_len` bytes of packet
/// number and the plaintext payload up to `payload_end`. The tag is written
/// after the payload; returns the total packet length.
pub fn seal(
    pkt: &mut [u8],
    pn_off: usize,
    pn: u64,
    pn_len: usize,
    payload_end: usize,
    keys: &DirectionalKeys,
) -> Result<usize, Error> {
    let tag_len = keys.packet.tag_len();
    let total = payload_end + tag_len;
    if pkt.len() < total {
        return Err(Error::BufferTooShort { needed: total - pkt.len() });
    }

    pkt[pn_off..pn_off + pn_len].copy_from_slice(&truncate_pn(pn, pn_len)[..pn_len]);

    let (header, rest) = pkt.split_at_mut(pn_off + pn_len);
    let payload_len = payload_end - (pn_off + pn_len);
    let tag = keys
        .packet
        .encrypt_in_place(pn, header, &mut rest[..payload_len])
        .map_err(|_| Error::CryptoFail)?;
    rest[payload_len..payload_len + tag_len].copy_from_slice(tag.as_ref());

    let sample_len = keys.header.sample_len();
    let sample_start = pn_off + SAMPLE_OFFSET;
    if total < sample_start + sample_len {
        return Err(Error::BufferTooShort { needed: sample_start + sample_len - total });
    }
    let mut sample = [0u8; 32];
    let sample = &mut sample[..sample_len];
    sample.copy_from_slice(&pkt[sample_start..sample_start + sample_len]);

    let (head, rest) = pkt.split_at_mut(pn_off);
    keys.header
        .encrypt_in_place(sample, &mut head[0], &mut rest[..pn_len])
        .map_err(|_| Error::CryptoFail)?;

    Ok(total)
}
