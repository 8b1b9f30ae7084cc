//! Connection IDs: generation and stateless signing.

use core::fmt;
use core::ops::Deref;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::Error;
use crate::transport::Rng;

/// Longest connection ID permitted by QUIC v1.
pub const MAX_CONN_ID_LEN: usize = 20;

/// An owned connection ID of at most [`MAX_CONN_ID_LEN`] bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(heapless::Vec<u8, MAX_CONN_ID_LEN>);

impl ConnectionId {
    /// Copy `bytes` into a new ID. Fails with `InvalidPacket` when longer
    /// than 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        heapless::Vec::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidPacket)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for ConnectionId {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

/// A fresh random 20-byte connection ID.
pub fn new_connection_id<R: Rng + ?Sized>(rng: &mut R) -> ConnectionId {
    let mut id = [0u8; MAX_CONN_ID_LEN];
    rng.fill(&mut id);
    let mut v = heapless::Vec::new();
    // capacity equals the array length
    let _ = v.extend_from_slice(&id);
    ConnectionId(v)
}

/// Derive a connection ID from `id` with HMAC-SHA256 keyed by `seed`,
/// truncated to 20 bytes.
///
/// A server uses this to map the client-chosen DCID of an Initial packet to
/// the SCID it will use, without keeping any per-client state.
pub fn sign_connection_id(seed: &[u8], id: &[u8]) -> Result<ConnectionId, Error> {
    let mut mac = Hmac::<Sha256>::new_from_slice(seed).map_err(|_| Error::CryptoFail)?;
    mac.update(id);
    let tag = mac.finalize().into_bytes();
    ConnectionId::from_slice(&tag[..MAX_CONN_ID_LEN])
}
