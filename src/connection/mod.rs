//! QUIC connection state machine.
//!
//! A [`Connection`] never touches a socket or reads a clock. The caller
//! feeds received datagrams to [`Connection::recv`], drains outgoing
//! datagrams from [`Connection::send`] until it returns `Done`, and drives
//! timers with [`Connection::timeout`] and [`Connection::on_timeout`].

mod keys;
mod recv;
mod streams;
mod transmit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::Side;
use rustls::quic::KeyChange;
use tracing::{debug, trace};

pub use streams::{Shutdown, StreamIter};

use crate::cid::{ConnectionId, new_connection_id};
use crate::config::Config;
use crate::error::{Error, TransportError};
use crate::packet::Epoch;
use crate::tls::{self, TlsSession, TransportParams};
use crate::transport::buffer::{RecvBuf, SendBuf};
use crate::transport::flow_control::{RecvWindow, SendCredit};
use crate::transport::ranges::PnRanges;
use crate::transport::recovery::Recovery;
use crate::transport::stream::{StreamLimits, StreamMap};
use crate::transport::{Instant, MICROS_PER_MILLI, Rng, SystemRng};
use crate::varint::push_varint;
use keys::ConnectionKeys;

/// Peer max_ack_delay assumed until its transport parameters arrive.
const DEFAULT_MAX_ACK_DELAY: u64 = 25 * MICROS_PER_MILLI;

/// Out-of-order CRYPTO data buffered per packet number space.
const MAX_CRYPTO_BUFFER: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// High-level state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TLS handshake in progress, possibly with early data.
    Handshaking,
    /// Handshake complete, data can be exchanged.
    Established,
    /// We are sending, or have sent, CONNECTION_CLOSE.
    Closing,
    /// We received a CONNECTION_CLOSE and are waiting out the drain period.
    Draining,
    Closed,
}

/// Error reported in a CONNECTION_CLOSE frame, ours or the peer's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    /// Application (0x1d) rather than transport (0x1c) close.
    pub is_app: bool,
    pub error_code: u64,
    pub reason: Vec<u8>,
}

/// Where to send a datagram produced by [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInfo {
    pub to: SocketAddr,
}

/// Point-in-time connection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub recv: usize,
    pub sent: usize,
    pub lost: usize,
    pub recv_bytes: u64,
    pub sent_bytes: u64,
    pub lost_bytes: u64,
    pub retrans: usize,
    /// Smoothed RTT.
    pub rtt: Duration,
    /// Congestion window in bytes.
    pub cwnd: u64,
    /// Bytes per second.
    pub delivery_rate: u64,
}

// ---------------------------------------------------------------------------
// Packet number space
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct PacketSpace {
    pub next_pn: u64,
    pub recv_pns: PnRanges,
    /// When the largest packet number so far arrived.
    pub largest_rx_time: Instant,
    /// An ack-eliciting packet arrived since we last sent an ACK.
    pub ack_pending: bool,
    pub crypto_send: SendBuf,
    pub crypto_recv: RecvBuf,
    /// A PTO asked for an ack-eliciting packet in this space.
    pub probe_pending: bool,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A QUIC connection, client or server.
pub struct Connection {
    trace_id: String,
    is_server: bool,
    state: ConnectionState,
    config: Arc<Config>,

    /// Created at construction on a client and on the first Initial on a
    /// server, once the original DCID is known.
    tls: Option<TlsSession>,
    keys: ConnectionKeys,
    spaces: [PacketSpace; 3],
    /// Space the TLS engine is currently writing handshake bytes for.
    crypto_epoch: Epoch,

    scid: ConnectionId,
    dcid: ConnectionId,
    /// DCID of the client's first Initial.
    odcid: Option<ConnectionId>,
    /// SCID of the Retry we acted on (client).
    rscid: Option<ConnectionId>,
    retry_token: Vec<u8>,
    did_retry: bool,

    local_params: TransportParams,
    peer_params: Option<TransportParams>,

    recovery: Recovery,
    streams: StreamMap,
    rx_data: RecvWindow,
    tx_credit: SendCredit,
    max_data_pending: bool,
    /// MAX_STREAMS to resend, bidirectional first.
    max_streams_pending: [bool; 2],

    handshake_completed: bool,
    handshake_confirmed: bool,
    handshake_done_pending: bool,
    handshake_done_acked: bool,
    got_peer_packet: bool,

    address_validated: bool,
    bytes_received: usize,
    bytes_sent: usize,
    path_response: Option<[u8; 8]>,
    peer_addr: SocketAddr,
    max_send_udp_payload: usize,

    /// Effective idle timeout in microseconds.
    idle_timeout: Option<u64>,
    idle_timer: Option<Instant>,
    /// End of the closing or draining period.
    draining_timer: Option<Instant>,
    close_pending: bool,
    /// Packets received since our CONNECTION_CLOSE first went out.
    closing_rx: u32,
    local_error: Option<ConnectionError>,
    peer_error: Option<ConnectionError>,
    timed_out: bool,

    recv_count: usize,
    sent_count: usize,
    recv_bytes: u64,
    sent_bytes: u64,
}

/// Start a client connection to `peer`.
///
/// `server_name` is used for SNI and certificate verification. The first
/// Initial packet is ready to be drained from [`Connection::send`].
pub fn connect(
    server_name: &str,
    scid: &ConnectionId,
    peer: SocketAddr,
    config: Arc<Config>,
    now: Instant,
) -> Result<Connection, Error> {
    let dcid = new_connection_id(&mut SystemRng);
    let mut conn = Connection::new(false, scid.clone(), dcid.clone(), peer, config, now);
    conn.odcid = Some(dcid.clone());
    conn.keys.install(Epoch::Initial, tls::initial_keys(&dcid, Side::Client)?);

    let params = conn.encoded_local_params();
    conn.tls = Some(TlsSession::client(conn.config.client_tls.clone(), server_name, params)?);
    conn.do_handshake(now)?;

    debug!(trace_id = %conn.trace_id, %dcid, server_name, "connecting");
    Ok(conn)
}

/// Create the server side of a connection for a client at `peer`.
///
/// `odcid` is the original destination connection ID recovered from a
/// validated Retry token, or `None` when no Retry took place.
pub fn accept(
    scid: &ConnectionId,
    odcid: Option<&ConnectionId>,
    peer: SocketAddr,
    config: Arc<Config>,
    now: Instant,
) -> Result<Connection, Error> {
    if config.server_tls.is_none() {
        return Err(Error::Tls { alert: None, reason: "no server certificate configured".into() });
    }

    let mut conn = Connection::new(true, scid.clone(), ConnectionId::empty(), peer, config, now);

    let mut reset_token = [0u8; 16];
    SystemRng.fill(&mut reset_token);
    conn.local_params.stateless_reset_token = Some(reset_token);

    if let Some(odcid) = odcid {
        // the token proved the client's address
        conn.odcid = Some(odcid.clone());
        conn.local_params.original_destination_connection_id = Some(odcid.clone());
        conn.local_params.retry_source_connection_id = Some(scid.clone());
        conn.did_retry = true;
        conn.address_validated = true;
    }

    debug!(trace_id = %conn.trace_id, %peer, retry = conn.did_retry, "accepting");
    Ok(conn)
}

impl Connection {
    fn new(
        is_server: bool,
        scid: ConnectionId,
        dcid: ConnectionId,
        peer: SocketAddr,
        config: Arc<Config>,
        now: Instant,
    ) -> Self {
        let mut local_params = config.local_params.clone();
        local_params.initial_source_connection_id = Some(scid.clone());

        let limits = StreamLimits {
            bidi_local: local_params.initial_max_stream_data_bidi_local,
            bidi_remote: local_params.initial_max_stream_data_bidi_remote,
            uni: local_params.initial_max_stream_data_uni,
        };
        let streams = StreamMap::new(
            !is_server,
            limits,
            local_params.initial_max_streams_bidi,
            local_params.initial_max_streams_uni,
        );
        let recovery = Recovery::new(
            !is_server,
            config.cc_algorithm,
            config.max_send_udp_payload_size,
            config.hystart,
            DEFAULT_MAX_ACK_DELAY,
        );
        let idle_timeout =
            (local_params.max_idle_timeout > 0).then(|| local_params.max_idle_timeout * MICROS_PER_MILLI);

        Self {
            trace_id: scid.to_string(),
            is_server,
            state: ConnectionState::Handshaking,
            tls: None,
            keys: ConnectionKeys::new(),
            spaces: Default::default(),
            crypto_epoch: Epoch::Initial,
            scid,
            dcid,
            odcid: None,
            rscid: None,
            retry_token: Vec::new(),
            did_retry: false,
            rx_data: RecvWindow::new(local_params.initial_max_data),
            tx_credit: SendCredit::new(0),
            local_params,
            peer_params: None,
            recovery,
            streams,
            max_data_pending: false,
            max_streams_pending: [false; 2],
            handshake_completed: false,
            handshake_confirmed: false,
            handshake_done_pending: false,
            handshake_done_acked: false,
            got_peer_packet: false,
            address_validated: !is_server,
            bytes_received: 0,
            bytes_sent: 0,
            path_response: None,
            peer_addr: peer,
            max_send_udp_payload: config.max_send_udp_payload_size,
            idle_timeout,
            idle_timer: idle_timeout.map(|t| now + t),
            draining_timer: None,
            close_pending: false,
            closing_rx: 0,
            local_error: None,
            peer_error: None,
            timed_out: false,
            recv_count: 0,
            sent_count: 0,
            recv_bytes: 0,
            sent_bytes: 0,
            config,
        }
    }

    /// Our transport parameters in wire form, with a reserved parameter
    /// appended when greasing.
    fn encoded_local_params(&self) -> Vec<u8> {
        let mut out = self.local_params.encode(self.is_server);
        if self.config.grease {
            let mut n = [0u8; 1];
            SystemRng.fill(&mut n);
            push_varint(31 * u64::from(n[0]) + 27, &mut out);
            push_varint(0, &mut out);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Move handshake bytes out of the TLS engine and pick up any new keys.
    fn do_handshake(&mut self, now: Instant) -> Result<(), Error> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(());
        };

        loop {
            let mut out = Vec::new();
            let change = tls.write_handshake(&mut out);
            if !out.is_empty() {
                self.spaces[self.crypto_epoch.index()].crypto_send.write(&out, false)?;
            }
            match change {
                None => break,
                Some(KeyChange::Handshake { keys }) => {
                    self.keys.install(Epoch::Handshake, keys);
                    self.crypto_epoch = Epoch::Handshake;
                    self.recovery.on_handshake_keys();
                    trace!(trace_id = %self.trace_id, "handshake keys installed");
                }
                Some(KeyChange::OneRtt { keys, .. }) => {
                    self.keys.install(Epoch::Application, keys);
                    self.crypto_epoch = Epoch::Application;
                    trace!(trace_id = %self.trace_id, "1-RTT keys installed");
                }
            }
        }

        if self.config.early_data && !self.handshake_completed && self.keys.zero_rtt().is_none() {
            if let Some(keys) = tls.zero_rtt_keys() {
                self.keys.set_zero_rtt(keys);
                debug!(trace_id = %self.trace_id, "0-RTT keys available");
            }
        }

        let raw_params = tls.peer_transport_params().map(<[u8]>::to_vec);
        let handshaking = tls.is_handshaking();

        // a resuming client learns the remembered parameters up front
        if self.peer_params.is_none()
            && let Some(raw) = &raw_params
        {
            let params = TransportParams::decode(raw, !self.is_server)?;
            self.apply_peer_params(params);
        }

        if !self.handshake_completed && !handshaking {
            self.on_handshake_complete(raw_params, now)?;
        }
        Ok(())
    }

    fn on_handshake_complete(&mut self, raw_params: Option<Vec<u8>>, now: Instant) -> Result<(), Error> {
        let raw = raw_params.ok_or(Error::Transport(TransportError::TransportParameterError))?;
        let params = TransportParams::decode(&raw, !self.is_server)?;
        self.validate_peer_params(&params)?;
        self.apply_peer_params(params);

        self.handshake_completed = true;
        if self.state == ConnectionState::Handshaking {
            self.state = ConnectionState::Established;
        }

        if self.is_server {
            self.handshake_confirmed = true;
            self.handshake_done_pending = true;
            self.address_validated = true;
            self.recovery.on_handshake_confirmed(now);
            self.discard_epoch(Epoch::Handshake, now);
        } else {
            let early = self.keys.zero_rtt().is_some();
            self.keys.discard_zero_rtt();
            let accepted = self.tls.as_ref().is_some_and(TlsSession::early_data_accepted);
            if early && !accepted {
                // the server dropped every 0-RTT packet, so their frames go
                // out again under 1-RTT keys without waiting for loss detection
                let frames = self.recovery.reset_space(Epoch::Application, now);
                debug!(trace_id = %self.trace_id, frames = frames.len(), "0-RTT rejected");
                self.requeue(Epoch::Application, frames);
            }
        }

        debug!(
            trace_id = %self.trace_id,
            alpn = %String::from_utf8_lossy(self.application_proto()),
            "handshake completed"
        );
        Ok(())
    }

    /// Check the connection ID parameters against what we observed on the
    /// wire (RFC 9000 §7.3).
    fn validate_peer_params(&self, params: &TransportParams) -> Result<(), Error> {
        let mismatch = Error::Transport(TransportError::TransportParameterError);

        if params.initial_source_connection_id.as_ref() != Some(&self.dcid) {
            debug!(trace_id = %self.trace_id, "initial_source_connection_id mismatch");
            return Err(mismatch);
        }
        if self.is_server {
            return Ok(());
        }
        if params.original_destination_connection_id.as_ref() != self.odcid.as_ref() {
            debug!(trace_id = %self.trace_id, "original_destination_connection_id mismatch");
            return Err(mismatch);
        }
        let expected_retry = if self.did_retry { self.rscid.as_ref() } else { None };
        if params.retry_source_connection_id.as_ref() != expected_retry {
            debug!(trace_id = %self.trace_id, "retry_source_connection_id mismatch");
            return Err(mismatch);
        }
        Ok(())
    }

    fn apply_peer_params(&mut self, params: TransportParams) {
        self.streams.set_peer_limits(
            StreamLimits {
                bidi_local: params.initial_max_stream_data_bidi_local,
                bidi_remote: params.initial_max_stream_data_bidi_remote,
                uni: params.initial_max_stream_data_uni,
            },
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
        );
        self.tx_credit.update_max(params.initial_max_data);
        self.recovery.rtt.set_max_ack_delay(params.max_ack_delay * MICROS_PER_MILLI);
        self.max_send_udp_payload = self
            .config
            .max_send_udp_payload_size
            .min(usize::try_from(params.max_udp_payload_size).unwrap_or(usize::MAX));

        self.idle_timeout = match (self.local_params.max_idle_timeout, params.max_idle_timeout) {
            (0, 0) => None,
            (0, t) | (t, 0) => Some(t),
            (a, b) => Some(a.min(b)),
        }
        .map(|ms| ms * MICROS_PER_MILLI);

        self.peer_params = Some(params);
    }

    /// Drop keys and recovery state of a packet number space.
    fn discard_epoch(&mut self, epoch: Epoch, now: Instant) {
        if self.recovery.is_discarded(epoch) {
            return;
        }
        self.keys.discard(epoch);
        self.recovery.on_space_discarded(epoch, now);
        let space = &mut self.spaces[epoch.index()];
        space.ack_pending = false;
        space.probe_pending = false;
        space.crypto_send = SendBuf::new();
        trace!(trace_id = %self.trace_id, ?epoch, "keys discarded");
    }

    fn reset_idle_timer(&mut self, now: Instant) {
        self.idle_timer = self.idle_timeout.map(|t| now + t.max(3 * self.recovery.pto()));
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Close the connection with `err`. The CONNECTION_CLOSE goes out with
    /// the next [`send`](Self::send).
    ///
    /// Returns `Done` if the connection is already closing or closed.
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<(), Error> {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed)
            || self.local_error.is_some()
        {
            return Err(Error::Done);
        }

        self.local_error = Some(ConnectionError { is_app: app, error_code: err, reason: reason.to_vec() });

        if self.got_peer_packet {
            self.state = ConnectionState::Closing;
            self.close_pending = true;
        } else {
            // nothing from the peer yet, so nobody to tell
            self.state = ConnectionState::Closed;
        }
        debug!(trace_id = %self.trace_id, app, err, "closing");
        Ok(())
    }

    /// Queue a CONNECTION_CLOSE for a fatal local error.
    fn close_on_error(&mut self, err: &Error) {
        if self.local_error.is_some()
            || matches!(self.state, ConnectionState::Draining | ConnectionState::Closed)
        {
            return;
        }
        tracing::warn!(trace_id = %self.trace_id, error = %err, code = err.to_wire(), "connection error");
        self.local_error =
            Some(ConnectionError { is_app: false, error_code: err.to_wire(), reason: Vec::new() });
        self.state = ConnectionState::Closing;
        self.close_pending = true;
    }

    fn enter_draining(&mut self, now: Instant) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Draining;
        self.close_pending = false;
        self.draining_timer = Some(now + 3 * self.recovery.pto());
        debug!(trace_id = %self.trace_id, "draining");
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Time until the next timer event, or `None` if no timer is armed.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let deadline = match self.state {
            ConnectionState::Closed => return None,
            ConnectionState::Closing | ConnectionState::Draining => {
                self.draining_timer.or(self.idle_timer)
            }
            _ => [self.recovery.loss_detection_timer(), self.idle_timer]
                .into_iter()
                .flatten()
                .min(),
        }?;
        Some(Duration::from_micros(deadline.saturating_sub(now)))
    }

    /// Process timers that expired at or before `now`.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if self.draining_timer.is_some_and(|t| now >= t) {
            self.state = ConnectionState::Closed;
            debug!(trace_id = %self.trace_id, "closed");
            return;
        }

        if self.idle_timer.is_some_and(|t| now >= t) {
            self.state = ConnectionState::Closed;
            self.timed_out = true;
            debug!(trace_id = %self.trace_id, "idle timeout");
            return;
        }

        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining) {
            return;
        }

        if self.recovery.loss_detection_timer().is_some_and(|t| now >= t) {
            let outcome = self.recovery.on_loss_detection_timeout(now);
            if let Some(epoch) = outcome.epoch {
                self.requeue(epoch, outcome.retransmit);
            }
            if let Some(epoch) = outcome.probe {
                self.spaces[epoch.index()].probe_pending = true;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn is_established(&self) -> bool {
        self.handshake_completed
    }

    /// 0-RTT keys are in use and the handshake has not completed yet.
    pub fn is_in_early_data(&self) -> bool {
        !self.handshake_completed && self.keys.zero_rtt().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Waiting out the closing or draining period.
    pub fn is_draining(&self) -> bool {
        self.state == ConnectionState::Draining
            || (self.state == ConnectionState::Closing && self.draining_timer.is_some())
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn peer_error(&self) -> Option<&ConnectionError> {
        self.peer_error.as_ref()
    }

    pub fn local_error(&self) -> Option<&ConnectionError> {
        self.local_error.as_ref()
    }

    /// Printable ID for log correlation: the SCID in hex.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn source_id(&self) -> &ConnectionId {
        &self.scid
    }

    pub fn destination_id(&self) -> &ConnectionId {
        &self.dcid
    }

    /// Negotiated ALPN, empty until known.
    pub fn application_proto(&self) -> &[u8] {
        self.tls.as_ref().and_then(|t| t.alpn()).unwrap_or_default()
    }

    /// SNI requested by the client (server side).
    pub fn server_name(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.server_name())
    }

    pub fn peer_transport_params(&self) -> Option<&TransportParams> {
        self.peer_params.as_ref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stats(&self) -> Stats {
        Stats {
            recv: self.recv_count,
            sent: self.sent_count,
            lost: self.recovery.lost_count,
            recv_bytes: self.recv_bytes,
            sent_bytes: self.sent_bytes,
            lost_bytes: self.recovery.lost_bytes,
            retrans: self.recovery.retrans_count,
            rtt: Duration::from_micros(self.recovery.rtt.smoothed()),
            cwnd: self.recovery.cc.cwnd(),
            delivery_rate: self.recovery.delivery_rate(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("trace_id", &self.trace_id)
            .field("is_server", &self.is_server)
            .field("state", &self.state)
            .field("dcid", &self.dcid)
            .finish_non_exhaustive()
    }
}
