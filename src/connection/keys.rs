//! Connection-level key management.
//!
//! Holds the packet protection keys the TLS engine hands out for each
//! packet number space, plus 0-RTT keys while early data is possible.

use rustls::quic::{DirectionalKeys, Keys};

use crate::packet::Epoch;

/// All keys for a QUIC connection, by packet number space.
pub(crate) struct ConnectionKeys {
    spaces: [Option<Keys>; 3],
    /// 0-RTT keys: ours to seal with on a client, ours to open with on a
    /// server.
    zero_rtt: Option<DirectionalKeys>,
}

impl ConnectionKeys {
    pub fn new() -> Self {
        Self { spaces: [None, None, None], zero_rtt: None }
    }

    pub fn install(&mut self, epoch: Epoch, keys: Keys) {
        self.spaces[epoch.index()] = Some(keys);
    }

    pub fn get(&self, epoch: Epoch) -> Option<&Keys> {
        self.spaces[epoch.index()].as_ref()
    }

    pub fn has(&self, epoch: Epoch) -> bool {
        self.spaces[epoch.index()].is_some()
    }

    pub fn discard(&mut self, epoch: Epoch) {
        self.spaces[epoch.index()] = None;
    }

    /// Highest space with keys installed.
    pub fn highest(&self) -> Option<Epoch> {
        Epoch::ALL.into_iter().rev().find(|e| self.has(*e))
    }

    pub fn set_zero_rtt(&mut self, keys: DirectionalKeys) {
        self.zero_rtt = Some(keys);
    }

    pub fn zero_rtt(&self) -> Option<&DirectionalKeys> {
        self.zero_rtt.as_ref()
    }

    pub fn discard_zero_rtt(&mut self) {
        self.zero_rtt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::initial_keys;
    use rustls::Side;

    #[test]
    fn install_discard_and_highest() {
        let mut keys = ConnectionKeys::new();
        assert_eq!(keys.highest(), None);

        keys.install(Epoch::Initial, initial_keys(b"\x01\x02\x03\x04", Side::Client).unwrap());
        keys.install(Epoch::Handshake, initial_keys(b"\x05\x06\x07\x08", Side::Client).unwrap());
        assert_eq!(keys.highest(), Some(Epoch::Handshake));

        keys.discard(Epoch::Handshake);
        assert!(!keys.has(Epoch::Handshake));
        assert!(keys.get(Epoch::Initial).is_some());
        assert_eq!(keys.highest(), Some(Epoch::Initial));
        assert!(keys.zero_rtt().is_none());
    }
}
