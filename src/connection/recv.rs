// Inbound path: datagram -> packets -> frames -> connection state.

use std::net::SocketAddr;

use rustls::Side;
use tracing::{debug, trace};

use super::{Connection, ConnectionError, ConnectionState, MAX_CRYPTO_BUFFER};
use crate::error::{Error, TransportError};
use crate::frame::{self, Frame};
use crate::packet::{Epoch, Header, MIN_CLIENT_INITIAL_LEN, Type, protection, retry};
use crate::tls::{self, TlsSession};
use crate::transport::Instant;
use crate::transport::recovery::SentFrame;
use crate::wire::Reader;

/// Reserved bits of the first byte once header protection is removed.
const LONG_RESERVED_BITS: u8 = 0x0c;
const SHORT_RESERVED_BITS: u8 = 0x18;

/// Shortest client DCID a server accepts on a first Initial.
const MIN_INITIAL_DCID_LEN: usize = 8;

/// Largest ack_delay_exponent a peer may advertise.
const MAX_ACK_DELAY_EXPONENT: u64 = 20;

fn protocol_violation() -> Error {
    Error::Transport(TransportError::ProtocolViolation)
}

/// Frames a 0-RTT packet must not carry (RFC 9000 §12.5).
fn allowed_in_zero_rtt(frame: &Frame<'_>) -> bool {
    !matches!(
        frame,
        Frame::Ack(_)
            | Frame::Crypto(_)
            | Frame::HandshakeDone
            | Frame::NewToken(_)
            | Frame::PathResponse(_)
            | Frame::RetireConnectionId(_)
    )
}

impl Connection {
    /// Process a datagram received from `from`.
    ///
    /// The buffer is decrypted in place. Returns the number of bytes
    /// consumed, which is the whole datagram unless it was dropped.
    /// Packets that cannot be processed are silently discarded; a protocol
    /// violation queues a CONNECTION_CLOSE and is also returned.
    pub fn recv(&mut self, buf: &mut [u8], from: SocketAddr, now: Instant) -> Result<usize, Error> {
        if self.state == ConnectionState::Closed {
            return Err(Error::Done);
        }
        if from != self.peer_addr {
            debug!(trace_id = %self.trace_id, %from, "datagram from unknown address");
            return Err(Error::Done);
        }

        let len = buf.len();
        if self.is_server && self.tls.is_none() && len < MIN_CLIENT_INITIAL_LEN {
            debug!(trace_id = %self.trace_id, len, "initial datagram too short");
            return Err(Error::Done);
        }
        if !self.address_validated {
            self.bytes_received += len;
        }

        let mut off = 0;
        while off < len {
            match self.recv_single(&mut buf[off..], now) {
                Ok(read) => off += read,
                Err(Error::Done) => break,
                Err(e) => {
                    self.close_on_error(&e);
                    return Err(e);
                }
            }
        }

        self.streams.collect_complete();
        Ok(len)
    }

    /// Process the packet at the front of `buf`; returns its length.
    fn recv_single(&mut self, buf: &mut [u8], now: Instant) -> Result<usize, Error> {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return Err(Error::Done);
        }

        let mut r = Reader::new(buf);
        let Ok(hdr) = Header::from_reader(&mut r, self.scid.len()) else {
            trace!(trace_id = %self.trace_id, "unparseable header");
            return Err(Error::Done);
        };

        match hdr.ty {
            Type::VersionNegotiation => {
                self.on_version_negotiation(&hdr);
                return Err(Error::Done);
            }
            Type::Retry => {
                self.on_retry(&hdr, buf, now)?;
                return Err(Error::Done);
            }
            Type::Short => {}
            _ if hdr.version != self.config.version => {
                trace!(trace_id = %self.trace_id, version = hdr.version, "version mismatch");
                return Err(Error::Done);
            }
            _ => {}
        }

        let (pn_off, pkt_len) = if hdr.ty == Type::Short {
            (r.off(), buf.len())
        } else {
            let Ok(len) = r.get_varint() else {
                return Err(Error::Done);
            };
            let pn_off = r.off();
            let pkt_len = usize::try_from(len).ok().and_then(|l| l.checked_add(pn_off));
            match pkt_len {
                Some(l) if l <= buf.len() => (pn_off, l),
                _ => return Err(Error::Done),
            }
        };

        if self.is_server && self.tls.is_none() {
            if hdr.ty != Type::Initial {
                return Err(Error::Done);
            }
            self.init_server(&hdr)?;
        }

        let epoch = hdr.ty.to_epoch()?;
        if self.recovery.is_discarded(epoch) {
            trace!(trace_id = %self.trace_id, ?epoch, "packet for discarded space");
            return Ok(pkt_len);
        }

        let is_zero_rtt = hdr.ty == Type::ZeroRTT;
        let keys = if is_zero_rtt {
            if !self.is_server {
                return Ok(pkt_len);
            }
            self.keys.zero_rtt()
        } else {
            self.keys.get(epoch).map(|k| &k.remote)
        };
        let Some(keys) = keys else {
            trace!(trace_id = %self.trace_id, ty = ?hdr.ty, "no keys for packet, dropping");
            return Ok(pkt_len);
        };

        let largest = self.spaces[epoch.index()].recv_pns.largest();
        let opened = match protection::open(&mut buf[..pkt_len], pn_off, largest, keys) {
            Ok(o) => o,
            Err(e) => {
                debug!(trace_id = %self.trace_id, ty = ?hdr.ty, error = %e, "undecryptable packet");
                return Ok(pkt_len);
            }
        };

        let reserved = if hdr.ty == Type::Short { SHORT_RESERVED_BITS } else { LONG_RESERVED_BITS };
        if opened.first & reserved != 0 {
            return Err(protocol_violation());
        }

        if self.spaces[epoch.index()].recv_pns.contains(opened.pn) {
            trace!(trace_id = %self.trace_id, pn = opened.pn, "duplicate packet");
            return Ok(pkt_len);
        }

        // the server picks its own ID; adopt it from its first packet
        if !self.is_server && hdr.ty != Type::Short && !self.got_peer_packet {
            self.dcid = hdr.scid.clone();
        }

        if opened.payload_len == 0 {
            return Err(protocol_violation());
        }

        let payload_off = pn_off + opened.pn_len;
        let payload = &buf[payload_off..payload_off + opened.payload_len];
        let mut r = Reader::new(payload);
        let mut ack_eliciting = false;
        while !r.is_empty() {
            let frame = frame::decode(&mut r)?;
            if !frame.allowed_in(epoch) || (is_zero_rtt && !allowed_in_zero_rtt(&frame)) {
                debug!(trace_id = %self.trace_id, ?epoch, ty = frame.type_code(), "frame not allowed");
                return Err(protocol_violation());
            }
            ack_eliciting |= frame.ack_eliciting();
            self.process_frame(frame, epoch, now)?;
        }

        let space = &mut self.spaces[epoch.index()];
        if space.recv_pns.largest().is_none_or(|l| opened.pn > l) {
            space.largest_rx_time = now;
        }
        space.recv_pns.insert(opened.pn);
        if ack_eliciting {
            space.ack_pending = true;
        }

        // a closing endpoint answers with its CONNECTION_CLOSE, backing off
        // to every 2^n-th packet
        if self.state == ConnectionState::Closing && self.draining_timer.is_some() {
            self.closing_rx += 1;
            if self.closing_rx.is_power_of_two() {
                self.close_pending = true;
            }
        }

        self.got_peer_packet = true;
        self.recv_count += 1;
        self.recv_bytes += pkt_len as u64;
        trace!(trace_id = %self.trace_id, ty = ?hdr.ty, pn = opened.pn, len = pkt_len, "rx pkt");

        // a Handshake packet proves the client owns its address
        if self.is_server && epoch == Epoch::Handshake {
            self.address_validated = true;
            self.discard_epoch(Epoch::Initial, now);
        }

        self.do_handshake(now)?;
        self.reset_idle_timer(now);
        Ok(pkt_len)
    }

    /// First Initial on a server: learn the client's IDs, derive Initial
    /// keys and start TLS.
    fn init_server(&mut self, hdr: &Header) -> Result<(), Error> {
        if hdr.dcid.len() < MIN_INITIAL_DCID_LEN {
            debug!(trace_id = %self.trace_id, len = hdr.dcid.len(), "client DCID too short");
            return Err(Error::Done);
        }

        self.dcid = hdr.scid.clone();
        if self.odcid.is_none() {
            self.odcid = Some(hdr.dcid.clone());
            self.local_params.original_destination_connection_id = Some(hdr.dcid.clone());
        }
        self.keys.install(Epoch::Initial, tls::initial_keys(&hdr.dcid, Side::Server)?);

        let server_tls = self.config.server_tls.clone().ok_or_else(|| Error::Tls {
            alert: None,
            reason: "no server certificate configured".into(),
        })?;
        let params = self.encoded_local_params();
        self.tls = Some(TlsSession::server(server_tls, params)?);
        debug!(trace_id = %self.trace_id, dcid = %self.dcid, "server handshake started");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frames
    // -----------------------------------------------------------------------

    fn process_frame(&mut self, frame: Frame<'_>, epoch: Epoch, now: Instant) -> Result<(), Error> {
        match frame {
            Frame::Padding(_) | Frame::Ping => {}

            Frame::Ack(ack) => {
                let exponent = self
                    .peer_params
                    .as_ref()
                    .map_or(3, |p| p.ack_delay_exponent)
                    .min(MAX_ACK_DELAY_EXPONENT);
                let delay = ack.ack_delay.saturating_mul(1 << exponent);
                let outcome = self.recovery.on_ack_received(epoch, &ack.ranges, delay, now)?;
                for f in outcome.acked {
                    self.on_frame_acked(epoch, f);
                }
                self.requeue(epoch, outcome.lost);
            }

            Frame::Crypto(f) => {
                let space = &mut self.spaces[epoch.index()];
                let end = f.offset + f.data.len() as u64;
                if end > space.crypto_recv.read_off() + MAX_CRYPTO_BUFFER {
                    return Err(Error::Transport(TransportError::CryptoBufferExceeded));
                }
                space.crypto_recv.write(f.offset, f.data, false)?;
                let data = space.crypto_recv.read_all();
                if !data.is_empty()
                    && let Some(tls) = self.tls.as_mut()
                {
                    tls.read_handshake(&data)?;
                }
            }

            Frame::Stream(f) => {
                let stream = match self.streams.get_or_create(f.stream_id, false) {
                    Ok(s) => s,
                    Err(Error::Done) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if !stream.has_recv() {
                    return Err(Error::InvalidStreamState(f.stream_id));
                }
                let advanced = stream.recv.write(f.offset, f.data, f.fin)?;
                stream.recv_window.on_received(advanced)?;
                self.rx_data.on_received(advanced)?;
                if stream.is_recv_shutdown() {
                    stream.recv.shutdown();
                    stream.recv_window.on_consumed(advanced);
                    self.rx_data.on_consumed(advanced);
                }
            }

            Frame::ResetStream(f) => {
                let stream = match self.streams.get_or_create(f.stream_id, false) {
                    Ok(s) => s,
                    Err(Error::Done) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if !stream.has_recv() {
                    return Err(Error::InvalidStreamState(f.stream_id));
                }
                let unread = f.final_size.saturating_sub(stream.recv.read_off());
                let advanced = stream.recv.reset(f.final_size)?;
                stream.recv_window.on_received(advanced)?;
                self.rx_data.on_received(advanced)?;
                if stream.peer_reset.is_none() {
                    stream.peer_reset = Some(f.error_code);
                    stream.recv_window.on_consumed(unread);
                    self.rx_data.on_consumed(unread);
                    debug!(trace_id = %self.trace_id, id = f.stream_id, code = f.error_code, "stream reset by peer");
                }
            }

            Frame::StopSending(f) => {
                let stream = match self.streams.get_or_create(f.stream_id, false) {
                    Ok(s) => s,
                    Err(Error::Done) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if !stream.has_send() {
                    return Err(Error::InvalidStreamState(f.stream_id));
                }
                if stream.stopped.is_none() {
                    stream.stopped = Some(f.error_code);
                    if !stream.send.is_reset() && !stream.send.is_complete() {
                        let final_size = stream.send.len();
                        stream.send.reset();
                        stream.reset_pending = Some((f.error_code, final_size));
                        stream.local_reset = Some((f.error_code, final_size));
                    }
                    debug!(trace_id = %self.trace_id, id = f.stream_id, code = f.error_code, "stop sending");
                }
            }

            Frame::NewToken(_) => {
                if self.is_server {
                    return Err(protocol_violation());
                }
            }

            Frame::MaxData(max) => {
                self.tx_credit.update_max(max);
            }

            Frame::MaxStreamData { stream_id, max } => {
                let stream = match self.streams.get_or_create(stream_id, false) {
                    Ok(s) => s,
                    Err(Error::Done) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if !stream.has_send() {
                    return Err(Error::InvalidStreamState(stream_id));
                }
                stream.send_credit.update_max(max);
            }

            Frame::MaxStreams { bidi, max } => {
                if max > 1 << 60 {
                    return Err(Error::Transport(TransportError::FrameEncodingError));
                }
                self.streams.update_peer_max_streams(bidi, max);
            }

            Frame::DataBlocked(limit) => {
                trace!(trace_id = %self.trace_id, limit, "peer blocked on connection credit");
            }

            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(trace_id = %self.trace_id, stream_id, limit, "peer blocked on stream credit");
            }

            Frame::StreamsBlocked { bidi, limit } => {
                trace!(trace_id = %self.trace_id, bidi, limit, "peer blocked on stream count");
            }

            Frame::NewConnectionId(f) => {
                if f.connection_id.is_empty() {
                    return Err(protocol_violation());
                }
            }

            Frame::RetireConnectionId(_) | Frame::PathResponse(_) => {}

            Frame::PathChallenge(data) => {
                self.path_response = Some(data);
            }

            Frame::ConnectionClose(c) => {
                debug!(
                    trace_id = %self.trace_id,
                    app = c.is_application,
                    code = c.error_code,
                    reason = %String::from_utf8_lossy(c.reason),
                    "peer closed connection"
                );
                self.peer_error = Some(ConnectionError {
                    is_app: c.is_application,
                    error_code: c.error_code,
                    reason: c.reason.to_vec(),
                });
                self.enter_draining(now);
            }

            Frame::HandshakeDone => {
                if self.is_server {
                    return Err(protocol_violation());
                }
                if !self.handshake_confirmed {
                    self.handshake_confirmed = true;
                    self.recovery.on_handshake_confirmed(now);
                    self.discard_epoch(Epoch::Handshake, now);
                    debug!(trace_id = %self.trace_id, "handshake confirmed");
                }
            }
        }
        Ok(())
    }

    fn on_frame_acked(&mut self, epoch: Epoch, frame: SentFrame) {
        match frame {
            SentFrame::Crypto { offset, len } => {
                self.spaces[epoch.index()].crypto_send.ack(offset, len, false);
            }
            SentFrame::Stream { id, offset, len, fin } => {
                if let Some(s) = self.streams.get_mut(id) {
                    s.send.ack(offset, len, fin);
                }
            }
            SentFrame::ResetStream { id } => {
                if let Some(s) = self.streams.get_mut(id) {
                    s.local_reset = None;
                }
            }
            SentFrame::StopSending { id } => {
                if let Some(s) = self.streams.get_mut(id) {
                    s.local_stop = None;
                }
            }
            SentFrame::HandshakeDone => self.handshake_done_acked = true,
            SentFrame::MaxData
            | SentFrame::MaxStreamData { .. }
            | SentFrame::MaxStreams { .. }
            | SentFrame::Ping
            | SentFrame::PathResponse => {}
        }
    }

    /// Queue the content of lost packets for sending again.
    pub(super) fn requeue(&mut self, epoch: Epoch, frames: Vec<SentFrame>) {
        for frame in frames {
            match frame {
                SentFrame::Crypto { offset, len } => {
                    if !self.recovery.is_discarded(epoch) {
                        self.spaces[epoch.index()].crypto_send.retransmit(offset, len, false);
                    }
                }
                SentFrame::Stream { id, offset, len, fin } => {
                    if let Some(s) = self.streams.get_mut(id)
                        && !s.send.is_reset()
                    {
                        s.send.retransmit(offset, len, fin);
                    }
                }
                SentFrame::ResetStream { id } => {
                    if let Some(s) = self.streams.get_mut(id)
                        && s.local_reset.is_some()
                    {
                        s.reset_pending = s.local_reset;
                    }
                }
                SentFrame::StopSending { id } => {
                    if let Some(s) = self.streams.get_mut(id)
                        && !s.recv.is_fin()
                    {
                        s.stop_pending = s.local_stop;
                    }
                }
                SentFrame::MaxData => self.max_data_pending = true,
                SentFrame::MaxStreamData { id } => {
                    if let Some(s) = self.streams.get_mut(id)
                        && s.recv.final_size().is_none()
                    {
                        s.max_data_pending = true;
                    }
                }
                SentFrame::MaxStreams { bidi } => self.max_streams_pending[usize::from(!bidi)] = true,
                SentFrame::HandshakeDone => {
                    if !self.handshake_done_acked {
                        self.handshake_done_pending = true;
                    }
                }
                SentFrame::Ping | SentFrame::PathResponse => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Version Negotiation and Retry
    // -----------------------------------------------------------------------

    fn on_version_negotiation(&mut self, hdr: &Header) {
        if self.is_server || self.got_peer_packet || self.did_retry {
            return;
        }
        if hdr.dcid != self.scid || hdr.scid != self.dcid {
            debug!(trace_id = %self.trace_id, "version negotiation for another connection");
            return;
        }
        let versions = hdr.versions.as_deref().unwrap_or_default();
        if versions.contains(&self.config.version) {
            // a genuine server would not list the version we offered
            return;
        }

        debug!(trace_id = %self.trace_id, ?versions, "no common version");
        self.local_error = Some(ConnectionError {
            is_app: false,
            error_code: TransportError::VersionNegotiationError.to_code(),
            reason: Vec::new(),
        });
        self.state = ConnectionState::Closed;
    }

    fn on_retry(&mut self, hdr: &Header, pkt: &[u8], now: Instant) -> Result<(), Error> {
        if self.is_server || self.did_retry || self.got_peer_packet {
            return Ok(());
        }
        if hdr.dcid != self.scid {
            return Ok(());
        }
        let Some(odcid) = self.odcid.clone() else {
            return Ok(());
        };
        if retry::verify(&odcid, pkt).is_err() {
            debug!(trace_id = %self.trace_id, "retry integrity check failed");
            return Ok(());
        }
        let token = hdr.token.clone().unwrap_or_default();
        if token.is_empty() {
            return Ok(());
        }

        debug!(trace_id = %self.trace_id, scid = %hdr.scid, "retry");
        self.did_retry = true;
        self.retry_token = token;
        self.rscid = Some(hdr.scid.clone());
        self.dcid = hdr.scid.clone();
        self.keys.install(Epoch::Initial, tls::initial_keys(&hdr.scid, Side::Client)?);

        // the ClientHello goes out again under the new keys
        let _ = self.recovery.reset_space(Epoch::Initial, now);
        let space = &mut self.spaces[Epoch::Initial.index()];
        let sent = space.crypto_send.max_sent();
        space.crypto_send.retransmit(0, sent, false);
        Ok(())
    }
}
