//! TLS 1.3 handshake for QUIC, delegated to rustls.
//!
//! QUIC uses TLS 1.3 differently from TCP:
//! - No TLS record layer. Handshake messages travel in CRYPTO frames.
//! - No TLS content encryption. QUIC protects packets itself with keys the
//!   TLS engine hands out per epoch.
//! - QUIC transport parameters are exchanged as a TLS extension.

pub mod transport_params;

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::quic::{self, KeyChange, Keys, Version};
use rustls::{DigitallySignedStruct, Side, SignatureScheme};

pub use transport_params::TransportParams;

use crate::error::Error;

/// TLS alert `internal_error`.
const ALERT_INTERNAL_ERROR: u8 = 80;

/// The suite every QUIC v1 endpoint uses for Initial packets.
fn initial_suite() -> Option<quic::Suite> {
    rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256
        .tls13()
        .and_then(|s| s.quic_suite())
}

/// Initial packet protection keys derived from the client's first DCID
/// (RFC 9001 §5.2).
pub fn initial_keys(dcid: &[u8], side: Side) -> Result<Keys, Error> {
    let suite = initial_suite().ok_or(Error::CryptoFail)?;
    Ok(suite.keys(dcid, side, Version::V1))
}

/// Whether the crypto backend can derive Initial keys.
pub(crate) fn initial_suite_available() -> bool {
    initial_suite().is_some()
}

/// One endpoint's side of the handshake.
pub struct TlsSession {
    conn: quic::Connection,
}

impl TlsSession {
    pub fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        params: Vec<u8>,
    ) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|e| Error::Tls {
            alert: None,
            reason: e.to_string(),
        })?;
        let conn = quic::ClientConnection::new(config, Version::V1, name, params)
            .map_err(|e| Error::Tls { alert: None, reason: e.to_string() })?;
        Ok(Self { conn: conn.into() })
    }

    pub fn server(config: Arc<rustls::ServerConfig>, params: Vec<u8>) -> Result<Self, Error> {
        let conn = quic::ServerConnection::new(config, Version::V1, params)
            .map_err(|e| Error::Tls { alert: None, reason: e.to_string() })?;
        Ok(Self { conn: conn.into() })
    }

    /// Feed in-order CRYPTO stream bytes.
    pub fn read_handshake(&mut self, data: &[u8]) -> Result<(), Error> {
        self.conn.read_hs(data).map_err(|e| {
            let alert = self.conn.alert().map(u8::from).unwrap_or(ALERT_INTERNAL_ERROR);
            Error::Tls { alert: Some(alert), reason: e.to_string() }
        })
    }

    /// Append outgoing handshake bytes for the current write epoch to `out`.
    ///
    /// A returned key change applies to everything written afterwards.
    pub fn write_handshake(&mut self, out: &mut Vec<u8>) -> Option<KeyChange> {
        self.conn.write_hs(out)
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// SNI the client asked for (server side).
    pub fn server_name(&self) -> Option<&str> {
        match &self.conn {
            quic::Connection::Server(s) => s.server_name(),
            quic::Connection::Client(_) => None,
        }
    }

    /// Raw transport parameters from the peer, once received.
    pub fn peer_transport_params(&self) -> Option<&[u8]> {
        self.conn.quic_transport_parameters()
    }

    /// 0-RTT keys, when resumption allows early data.
    pub fn zero_rtt_keys(&self) -> Option<quic::DirectionalKeys> {
        self.conn.zero_rtt_keys()
    }

    /// Whether the server took our early data. Always false on a server.
    pub fn early_data_accepted(&self) -> bool {
        match &self.conn {
            quic::Connection::Client(c) => c.is_early_data_accepted(),
            quic::Connection::Server(_) => false,
        }
    }
}

/// Certificate verifier that accepts any server certificate, used when peer
/// verification is turned off. Handshake signatures are still checked.
#[derive(Debug)]
pub(crate) struct AcceptAnyServerCert(pub Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_keys_are_symmetric() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let client = initial_keys(&dcid, Side::Client).unwrap();
        let server = initial_keys(&dcid, Side::Server).unwrap();
        assert_eq!(client.local.packet.tag_len(), 16);
        assert_eq!(server.remote.header.sample_len(), 16);
        assert!(initial_suite_available());
    }
}
