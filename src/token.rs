//! Stateless address-validation tokens for Retry.
//!
//! A token is `"quay" || nonce || seal(issued_at || address || odcid)`,
//! sealed with AES-128-GCM under a key derived from the server secret. The
//! server can recover the original destination connection ID from a token
//! without remembering anything about the client.

use std::net::{IpAddr, SocketAddr};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::cid::ConnectionId;
use crate::packet::Header;
use crate::transport::{Instant, MICROS_PER_MILLI, Rng};

const SERVER_TAG: &[u8; 4] = b"quay";
const NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"quay retry token";

/// Shortest token that could possibly be ours.
const MIN_TOKEN_LEN: usize = SERVER_TAG.len() + NONCE_LEN + AEAD_TAG_LEN + 8 + 1 + 4;

/// Mints and validates Retry tokens for one server secret.
pub struct TokenMinter {
    cipher: Aes128Gcm,
}

impl TokenMinter {
    /// Derive the sealing key from `secret` with HKDF-SHA256.
    pub fn new(secret: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(SERVER_TAG), secret);
        let mut key = [0u8; 16];
        hk.expand(HKDF_INFO, &mut key)
            .expect("16 bytes is within the HKDF-SHA256 output limit");
        Self { cipher: Aes128Gcm::new(&key.into()) }
    }

    /// A minter with a random secret, for servers that don't need tokens to
    /// survive a restart.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut secret = [0u8; 32];
        rng.fill(&mut secret);
        Self::new(&secret)
    }

    /// Mint a token binding the client's IP to the DCID of its Initial.
    pub fn mint_token<R: Rng + ?Sized>(
        &self,
        hdr: &Header,
        addr: &SocketAddr,
        now: Instant,
        rng: &mut R,
    ) -> Vec<u8> {
        let mut plain = Vec::with_capacity(8 + 17 + hdr.dcid.len());
        plain.extend_from_slice(&(now / MICROS_PER_MILLI).to_be_bytes());
        push_addr(&mut plain, addr);
        plain.extend_from_slice(&hdr.dcid);

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &plain, aad: SERVER_TAG })
            .expect("AES-GCM seals payloads far larger than a token");

        let mut token = Vec::with_capacity(SERVER_TAG.len() + NONCE_LEN + sealed.len());
        token.extend_from_slice(SERVER_TAG);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&sealed);
        token
    }

    /// Recover the original DCID from `token`, or `None` if the token is not
    /// one of ours or was issued to a different address.
    pub fn validate_token(&self, addr: &SocketAddr, token: &[u8]) -> Option<ConnectionId> {
        self.open(addr, token).map(|(_, odcid)| odcid)
    }

    /// Like [`validate_token`](Self::validate_token), but also rejects
    /// tokens issued more than `lifetime` microseconds before `now`.
    pub fn validate_token_within(
        &self,
        addr: &SocketAddr,
        token: &[u8],
        now: Instant,
        lifetime: u64,
    ) -> Option<ConnectionId> {
        let (issued_ms, odcid) = self.open(addr, token)?;
        let age = (now / MICROS_PER_MILLI).checked_sub(issued_ms)?;
        (age * MICROS_PER_MILLI <= lifetime).then_some(odcid)
    }

    fn open(&self, addr: &SocketAddr, token: &[u8]) -> Option<(u64, ConnectionId)> {
        if token.len() < MIN_TOKEN_LEN {
            return None;
        }
        let (tag, rest) = token.split_at(SERVER_TAG.len());
        if tag != SERVER_TAG {
            return None;
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: SERVER_TAG })
            .ok()?;

        let (issued, rest) = plain.split_at_checked(8)?;
        let issued_ms = u64::from_be_bytes(issued.try_into().ok()?);

        let mut expected = Vec::with_capacity(17);
        push_addr(&mut expected, addr);
        let odcid = rest.strip_prefix(expected.as_slice())?;
        ConnectionId::from_slice(odcid).ok().map(|id| (issued_ms, id))
    }
}

fn push_addr(out: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(6);
            out.extend_from_slice(&ip.octets());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Type;

    struct FixedRng(u8);

    impl Rng for FixedRng {
        fn fill(&mut self, buf: &mut [u8]) {
            buf.fill(self.0);
            self.0 = self.0.wrapping_add(1);
        }
    }

    fn initial(dcid: &[u8]) -> Header {
        Header {
            ty: Type::Initial,
            version: crate::PROTOCOL_VERSION,
            dcid: ConnectionId::from_slice(dcid).unwrap(),
            scid: ConnectionId::from_slice(&[1, 2, 3]).unwrap(),
            pkt_num: 0,
            pkt_num_len: 0,
            token: Some(Vec::new()),
            versions: None,
            key_phase: false,
        }
    }

    #[test]
    fn recovers_original_dcid() {
        let minter = TokenMinter::new(b"server secret");
        let addr: SocketAddr = "192.0.2.1:4433".parse().unwrap();
        let token = minter.mint_token(&initial(&[0xaa; 8]), &addr, 5_000_000, &mut FixedRng(1));
        assert!(token.starts_with(b"quay"));

        let odcid = minter.validate_token(&addr, &token).unwrap();
        assert_eq!(odcid.as_bytes(), &[0xaa; 8]);

        // bound to the IP, not the port
        let other_port: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        assert!(minter.validate_token(&other_port, &token).is_some());
    }

    #[test]
    fn rejects_foreign_or_tampered_tokens() {
        let minter = TokenMinter::new(b"server secret");
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let token = minter.mint_token(&initial(&[7; 20]), &addr, 0, &mut FixedRng(9));

        let elsewhere: SocketAddr = "[2001:db8::2]:443".parse().unwrap();
        assert!(minter.validate_token(&elsewhere, &token).is_none());

        let mut tampered = token.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert!(minter.validate_token(&addr, &tampered).is_none());

        let other = TokenMinter::new(b"another secret");
        assert!(other.validate_token(&addr, &token).is_none());

        assert!(minter.validate_token(&addr, &token[..8]).is_none());
        assert!(minter.validate_token(&addr, b"").is_none());
    }

    #[test]
    fn token_layout_for_largest_inputs() {
        let minter = TokenMinter::new(&[0x42; 64]);
        let addr: SocketAddr = "[2001:db8::9]:443".parse().unwrap();
        let token = minter.mint_token(&initial(&[0xee; 20]), &addr, u64::MAX, &mut FixedRng(0));

        // tag, nonce, then issued_at + v6 address + 20-byte DCID + AEAD tag
        assert_eq!(token.len(), SERVER_TAG.len() + NONCE_LEN + 8 + 17 + 20 + AEAD_TAG_LEN);
        assert_eq!(&token[4..4 + NONCE_LEN], &[0u8; NONCE_LEN]);
        assert_eq!(minter.validate_token(&addr, &token).unwrap().as_bytes(), &[0xee; 20]);

        // same secret, same key
        let again = TokenMinter::new(&[0x42; 64]);
        assert!(again.validate_token(&addr, &token).is_some());
    }

    #[test]
    fn lifetime_is_enforced() {
        let minter = TokenMinter::random(&mut FixedRng(3));
        let addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let token = minter.mint_token(&initial(&[1; 8]), &addr, 1_000_000, &mut FixedRng(4));

        assert!(minter.validate_token_within(&addr, &token, 3_000_000, 5_000_000).is_some());
        assert!(minter.validate_token_within(&addr, &token, 9_000_000, 5_000_000).is_none());
        // issued in the future
        assert!(minter.validate_token_within(&addr, &token, 0, 5_000_000).is_none());
    }
}
