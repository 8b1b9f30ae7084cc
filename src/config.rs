//! Connection configuration.
//!
//! A [`Config`] is built once through [`ConfigBuilder`] and then shared by
//! every connection created from it. TLS contexts are assembled at build
//! time, so bad key material surfaces before any connection exists.

use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::ConfigError;
use crate::packet::PROTOCOL_VERSION;
use crate::tls::transport_params::{MAX_ACK_DELAY_EXPONENT, MAX_ACK_DELAY_LIMIT};
use crate::tls::{AcceptAnyServerCert, TransportParams};
use crate::transport::congestion::CongestionControlAlgorithm;

/// Default UDP payload we send, leaving room for IPv6 and tunnel headers.
const DEFAULT_MAX_UDP_PAYLOAD: usize = 1350;

/// Smallest payload a QUIC endpoint must support.
const MIN_UDP_PAYLOAD: usize = 1200;

/// Immutable configuration shared by connections.
pub struct Config {
    pub(crate) version: u32,
    pub(crate) local_params: TransportParams,
    pub(crate) application_protos: Vec<Vec<u8>>,
    pub(crate) cc_algorithm: CongestionControlAlgorithm,
    pub(crate) hystart: bool,
    pub(crate) grease: bool,
    pub(crate) early_data: bool,
    pub(crate) verify_peer: bool,
    pub(crate) max_send_udp_payload_size: usize,
    pub(crate) client_tls: Arc<rustls::ClientConfig>,
    pub(crate) server_tls: Option<Arc<rustls::ServerConfig>>,
}

impl Config {
    /// Transport parameters this endpoint advertises, before connection IDs
    /// are filled in.
    pub fn local_transport_params(&self) -> &TransportParams {
        &self.local_params
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn application_protos(&self) -> &[Vec<u8>] {
        &self.application_protos
    }

    pub fn cc_algorithm(&self) -> CongestionControlAlgorithm {
        self.cc_algorithm
    }

    pub fn max_send_udp_payload_size(&self) -> usize {
        self.max_send_udp_payload_size
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// Whether connections from this config can act as a server.
    pub fn has_server_identity(&self) -> bool {
        self.server_tls.is_some()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("version", &self.version)
            .field("local_params", &self.local_params)
            .field("cc_algorithm", &self.cc_algorithm)
            .field("early_data", &self.early_data)
            .field("verify_peer", &self.verify_peer)
            .field("server", &self.server_tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
///
/// The ALPN list is taken up front so it can't be forgotten; everything
/// else has a default.
#[derive(Debug)]
pub struct ConfigBuilder {
    version: u32,
    params: TransportParams,
    application_protos: Vec<Vec<u8>>,
    cc_algorithm: CongestionControlAlgorithm,
    hystart: bool,
    grease: bool,
    early_data: bool,
    verify_peer: bool,
    cert_chain: Option<Vec<CertificateDer<'static>>>,
    private_key: Option<PrivateKeyDer<'static>>,
    roots: RootCertStore,
}

impl ConfigBuilder {
    /// Start a configuration advertising `application_protos`, most
    /// preferred first.
    pub fn new(application_protos: &[&[u8]]) -> Result<Self, ConfigError> {
        if application_protos.is_empty()
            || application_protos.iter().any(|p| p.is_empty() || p.len() > 255)
        {
            return Err(ConfigError::InvalidAlpn);
        }

        let params = TransportParams {
            max_udp_payload_size: DEFAULT_MAX_UDP_PAYLOAD as u64,
            ..TransportParams::default()
        };

        Ok(Self {
            version: PROTOCOL_VERSION,
            params,
            application_protos: application_protos.iter().map(|p| p.to_vec()).collect(),
            cc_algorithm: CongestionControlAlgorithm::Reno,
            hystart: true,
            grease: true,
            early_data: false,
            verify_peer: true,
            cert_chain: None,
            private_key: None,
            roots: RootCertStore::empty(),
        })
    }

    /// Start from the length-prefixed wire form, e.g. `b"\x02h3\x05h3-29"`.
    pub fn with_wire_protos(wire: &[u8]) -> Result<Self, ConfigError> {
        let mut protos = Vec::new();
        let mut rest = wire;
        while let Some((&len, tail)) = rest.split_first() {
            let (proto, tail) = tail
                .split_at_checked(usize::from(len))
                .ok_or(ConfigError::InvalidAlpn)?;
            protos.push(proto);
            rest = tail;
        }
        Self::new(&protos)
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Verify the server certificate against the configured trust anchors.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn grease(mut self, grease: bool) -> Self {
        self.grease = grease;
        self
    }

    pub fn enable_early_data(mut self) -> Self {
        self.early_data = true;
        self
    }

    pub fn enable_hystart(mut self, enable: bool) -> Self {
        self.hystart = enable;
        self
    }

    /// Idle timeout in milliseconds; 0 disables it.
    pub fn max_idle_timeout(mut self, ms: u64) -> Self {
        self.params.max_idle_timeout = ms;
        self
    }

    pub fn max_udp_payload_size(mut self, size: usize) -> Self {
        self.params.max_udp_payload_size = size.max(MIN_UDP_PAYLOAD) as u64;
        self
    }

    pub fn initial_max_data(mut self, v: u64) -> Self {
        self.params.initial_max_data = v;
        self
    }

    pub fn initial_max_stream_data_bidi_local(mut self, v: u64) -> Self {
        self.params.initial_max_stream_data_bidi_local = v;
        self
    }

    pub fn initial_max_stream_data_bidi_remote(mut self, v: u64) -> Self {
        self.params.initial_max_stream_data_bidi_remote = v;
        self
    }

    pub fn initial_max_stream_data_uni(mut self, v: u64) -> Self {
        self.params.initial_max_stream_data_uni = v;
        self
    }

    pub fn initial_max_streams_bidi(mut self, v: u64) -> Self {
        self.params.initial_max_streams_bidi = v;
        self
    }

    pub fn initial_max_streams_uni(mut self, v: u64) -> Self {
        self.params.initial_max_streams_uni = v;
        self
    }

    pub fn ack_delay_exponent(mut self, v: u64) -> Self {
        self.params.ack_delay_exponent = v;
        self
    }

    /// Maximum ack delay in milliseconds.
    pub fn max_ack_delay(mut self, ms: u64) -> Self {
        self.params.max_ack_delay = ms;
        self
    }

    pub fn active_connection_id_limit(mut self, v: u64) -> Self {
        self.params.active_connection_id_limit = v;
        self
    }

    pub fn disable_active_migration(mut self, v: bool) -> Self {
        self.params.disable_active_migration = v;
        self
    }

    pub fn cc_algorithm(mut self, algorithm: CongestionControlAlgorithm) -> Self {
        self.cc_algorithm = algorithm;
        self
    }

    /// Select the congestion controller by name, e.g. `"reno"`.
    pub fn cc_algorithm_name(mut self, name: &str) -> Result<Self, ConfigError> {
        self.cc_algorithm = name.parse()?;
        Ok(self)
    }

    pub fn load_cert_chain_from_pem_file(
        mut self,
        path: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let chain = CertificateDer::pem_file_iter(path)
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|source| ConfigError::Pem { path: path.to_owned(), source })?;
        self.cert_chain = Some(chain);
        Ok(self)
    }

    pub fn load_priv_key_from_pem_file(
        mut self,
        path: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let key = PrivateKeyDer::from_pem_file(path)
            .map_err(|source| ConfigError::Pem { path: path.to_owned(), source })?;
        self.private_key = Some(key);
        Ok(self)
    }

    /// Use an identity that is already DER-encoded in memory.
    pub fn with_cert_chain_der(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.cert_chain = Some(chain);
        self.private_key = Some(key);
        self
    }

    /// Add every certificate of a PEM file as a trust anchor.
    pub fn load_verify_locations_from_file(
        mut self,
        path: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let certs = CertificateDer::pem_file_iter(path)
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|source| ConfigError::Pem { path: path.to_owned(), source })?;
        for cert in certs {
            self.roots.add(cert)?;
        }
        Ok(self)
    }

    /// Add one DER certificate as a trust anchor.
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Result<Self, ConfigError> {
        self.roots.add(cert)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.params.ack_delay_exponent > MAX_ACK_DELAY_EXPONENT {
            return Err(ConfigError::InvalidTransportParam {
                name: "ack_delay_exponent",
                value: self.params.ack_delay_exponent,
            });
        }
        if self.params.max_ack_delay >= MAX_ACK_DELAY_LIMIT {
            return Err(ConfigError::InvalidTransportParam {
                name: "max_ack_delay",
                value: self.params.max_ack_delay,
            });
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let client = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?;
        let client = if self.verify_peer {
            client.with_root_certificates(self.roots)
        } else {
            client
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider.clone())))
        };
        let mut client = client.with_no_client_auth();
        client.alpn_protocols = self.application_protos.clone();
        client.enable_early_data = self.early_data;

        let server_tls = match (self.cert_chain, self.private_key) {
            (Some(chain), Some(key)) => {
                let mut server = rustls::ServerConfig::builder_with_provider(provider)
                    .with_protocol_versions(&[&rustls::version::TLS13])?
                    .with_no_client_auth()
                    .with_single_cert(chain, key)?;
                server.alpn_protocols = self.application_protos.clone();
                if self.early_data {
                    // QUIC only allows "no early data" or "unlimited"
                    server.max_early_data_size = u32::MAX;
                }
                Some(Arc::new(server))
            }
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteIdentity),
        };

        tracing::debug!(
            version = self.version,
            cc = ?self.cc_algorithm,
            server = server_tls.is_some(),
            "config built"
        );

        Ok(Config {
            version: self.version,
            max_send_udp_payload_size: self.params.max_udp_payload_size as usize,
            local_params: self.params,
            application_protos: self.application_protos,
            cc_algorithm: self.cc_algorithm,
            hystart: self.hystart,
            grease: self.grease,
            early_data: self.early_data,
            verify_peer: self.verify_peer,
            client_tls: Arc::new(client),
            server_tls,
        })
    }
}
