//! Sans-IO QUIC transport and HTTP/3.
//!
//! The engine never touches sockets or clocks. An application feeds
//! received datagrams to [`Connection::recv`], drains outgoing ones with
//! [`Connection::send`], and drives timers with [`Connection::timeout`] and
//! [`Connection::on_timeout`], passing the current [`Instant`] each time.
//!
//! ```no_run
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! quay::init()?;
//! let config = Arc::new(quay::ConfigBuilder::new(&quay::h3::H3_ALPN)?.build()?);
//! let scid = quay::new_connection_id(&mut quay::SystemRng);
//! let peer = "127.0.0.1:4433".parse()?;
//! let mut conn = quay::connect("localhost", &scid, peer, config, 0)?;
//!
//! let mut out = [0u8; 1350];
//! let (len, _info) = conn.send(&mut out, 0)?;
//! // hand out[..len] to the UDP socket
//! # let _ = len;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod cid;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod packet;
pub mod tls;
pub mod token;
pub mod transport;
pub mod varint;
pub mod wire;

#[cfg(feature = "h3")]
pub mod h3;

pub use cid::{new_connection_id, sign_connection_id, ConnectionId, MAX_CONN_ID_LEN};
pub use config::{Config, ConfigBuilder};
pub use connection::{
    accept, connect, Connection, ConnectionError, ConnectionState, SendInfo, Shutdown, Stats,
    StreamIter,
};
pub use error::{ConfigError, Error, H3Error, TransportError};
pub use packet::{negotiate_version, retry, version_is_supported, Header, Type, PROTOCOL_VERSION};
pub use token::TokenMinter;
pub use transport::congestion::CongestionControlAlgorithm;
pub use transport::{Instant, Rng, SystemRng, MICROS_PER_MILLI};

/// Prepare the process-wide crypto backend.
///
/// Installs the `ring` provider for rustls unless one is already installed,
/// then checks that QUIC Initial keys can be derived. Safe to call more
/// than once.
pub fn init() -> Result<(), Error> {
    // Err means another provider won the race, which is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    if !tls::initial_suite_available() {
        return Err(Error::CryptoFail);
    }
    tracing::debug!(version = PROTOCOL_VERSION, "quay initialized");
    Ok(())
}
