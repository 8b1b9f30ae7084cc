//! Retry packet integrity (RFC 9001 §5.8).

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce, Tag};

use crate::error::Error;

pub const TAG_LEN: usize = 16;

const RETRY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const RETRY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// Build the Retry pseudo-packet: the original DCID, length-prefixed,
/// followed by the Retry packet without its tag.
fn pseudo_packet(odcid: &[u8], retry_without_tag: &[u8]) -> Vec<u8> {
    let mut pseudo = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid);
    pseudo.extend_from_slice(retry_without_tag);
    pseudo
}

/// Compute the integrity tag over a Retry packet (without tag) sent in
/// response to an Initial addressed to `odcid`.
pub fn integrity_tag(odcid: &[u8], retry_without_tag: &[u8]) -> Result<[u8; TAG_LEN], Error> {
    let cipher = Aes128Gcm::new_from_slice(&RETRY_KEY_V1).map_err(|_| Error::CryptoFail)?;
    let aad = pseudo_packet(odcid, retry_without_tag);
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&RETRY_NONCE_V1), &aad, &mut [])
        .map_err(|_| Error::CryptoFail)?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Check the trailing integrity tag of a full Retry packet.
pub fn verify(odcid: &[u8], retry: &[u8]) -> Result<(), Error> {
    let Some(split) = retry.len().checked_sub(TAG_LEN) else {
        return Err(Error::InvalidPacket);
    };
    let (body, tag) = retry.split_at(split);
    let cipher = Aes128Gcm::new_from_slice(&RETRY_KEY_V1).map_err(|_| Error::CryptoFail)?;
    let aad = pseudo_packet(odcid, body);
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&RETRY_NONCE_V1),
            &aad,
            &mut [],
            Tag::from_slice(tag),
        )
        .map_err(|_| Error::CryptoFail)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    /// RFC 9001 A.4.
    #[test]
    fn rfc_retry_vector() {
        let odcid = hex!("8394c8f03e515708");
        let packet = hex!(
            "ff000000010008f067a5502a4262b5746f6b656e04a265ba2eff4d829058fb3f0f2496ba"
        );
        assert!(verify(&odcid, &packet).is_ok());

        let body = &packet[..packet.len() - TAG_LEN];
        assert_eq!(integrity_tag(&odcid, body).unwrap(), packet[packet.len() - TAG_LEN..]);
    }

    #[test]
    fn tampering_detected() {
        let odcid = hex!("8394c8f03e515708");
        let mut packet = hex!(
            "ff000000010008f067a5502a4262b5746f6b656e04a265ba2eff4d829058fb3f0f2496ba"
        );
        packet[10] ^= 1;
        assert_eq!(verify(&odcid, &packet), Err(Error::CryptoFail));
        assert_eq!(verify(&odcid, &packet[..8]), Err(Error::InvalidPacket));
    }
}
