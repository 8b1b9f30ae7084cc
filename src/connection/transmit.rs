// Outbound path: connection state -> frames -> packets -> datagram.

use rustls::quic::DirectionalKeys;
use tracing::trace;

use super::{Connection, ConnectionState, SendInfo};
use crate::error::{Error, TransportError};
use crate::frame::{
    self, AckFrame, ConnectionCloseFrame, CryptoFrame, Frame, ResetStreamFrame, StopSendingFrame,
    StreamFrame,
};
use crate::packet::{Epoch, Header, MIN_CLIENT_INITIAL_LEN, Type, number, protection};
use crate::transport::Instant;
use crate::transport::recovery::{SentFrame, SentPacket};
use crate::varint::{MAX_VARINT, encode_varint_with_len};
use crate::wire::Writer;

/// Largest packet whose Length fits the 2-byte field we reserve.
const MAX_PACKET_LEN: usize = 16383;

/// Header protection samples 16 bytes starting 4 bytes past the packet
/// number, so every payload is at least this long counting from it.
const MIN_PN_AND_PAYLOAD: usize = 4;

/// Encode `frame` if it fits; `Ok(false)` when out of room.
fn put_frame(w: &mut Writer<'_>, frame: &Frame<'_>) -> Result<bool, Error> {
    if frame::wire_len(frame) > w.cap() {
        return Ok(false);
    }
    frame::encode(frame, w)?;
    Ok(true)
}

impl Connection {
    /// Write the next datagram into `out`.
    ///
    /// Packets for several spaces are coalesced. Returns `Done` when there
    /// is nothing to send.
    pub fn send(&mut self, out: &mut [u8], now: Instant) -> Result<(usize, SendInfo), Error> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => return Err(Error::Done),
            ConnectionState::Closing if !self.close_pending => return Err(Error::Done),
            _ => {}
        }
        if self.tls.is_none() {
            return Err(Error::Done);
        }

        let mut limit = out.len().min(self.max_send_udp_payload).min(MAX_PACKET_LEN);
        if !self.address_validated {
            // anti-amplification (RFC 9000 §8.1)
            limit = limit.min((3 * self.bytes_received).saturating_sub(self.bytes_sent));
        }

        let mut written = 0;
        for epoch in Epoch::ALL {
            if written >= limit {
                break;
            }
            if let Some(n) = self.send_packet(epoch, &mut out[written..limit], now)? {
                written += n;
            }
        }

        if written == 0 {
            return Err(Error::Done);
        }
        self.bytes_sent += written;
        self.streams.collect_complete();
        Ok((written, SendInfo { to: self.peer_addr }))
    }

    /// Keys sealing packets of `epoch`, 0-RTT keys if `zero_rtt`.
    fn seal_keys(&self, epoch: Epoch, zero_rtt: bool) -> Option<&DirectionalKeys> {
        if zero_rtt {
            self.keys.zero_rtt()
        } else {
            self.keys.get(epoch).map(|k| &k.local)
        }
    }

    /// Build and protect one packet of `epoch` at the front of `buf`.
    /// `None` when the space has nothing to send or no room is left.
    fn send_packet(&mut self, epoch: Epoch, buf: &mut [u8], now: Instant) -> Result<Option<usize>, Error> {
        if self.recovery.is_discarded(epoch) {
            return Ok(None);
        }
        let zero_rtt = epoch == Epoch::Application
            && !self.is_server
            && !self.keys.has(Epoch::Application)
            && self.keys.zero_rtt().is_some();
        let closing = self.close_pending;
        if closing && (zero_rtt || self.keys.highest() != Some(epoch)) {
            return Ok(None);
        }
        let Some(tag_len) = self.seal_keys(epoch, zero_rtt).map(|k| k.packet.tag_len()) else {
            return Ok(None);
        };
        let Some(cap) = buf.len().checked_sub(tag_len) else {
            return Ok(None);
        };

        let idx = epoch.index();
        let pn = self.spaces[idx].next_pn;
        let pn_len = number::pn_length(pn, self.recovery.largest_acked(epoch));
        let ty = match epoch {
            Epoch::Initial => Type::Initial,
            Epoch::Handshake => Type::Handshake,
            Epoch::Application if zero_rtt => Type::ZeroRTT,
            Epoch::Application => Type::Short,
        };
        let hdr = Header {
            ty,
            version: self.config.version,
            dcid: self.dcid.clone(),
            scid: self.scid.clone(),
            pkt_num: pn,
            pkt_num_len: pn_len,
            token: (ty == Type::Initial).then(|| self.retry_token.clone()),
            versions: None,
            key_phase: false,
        };

        let mut w = Writer::new(&mut buf[..cap]);
        let Ok(()) = hdr.to_writer(&mut w) else {
            return Ok(None);
        };
        let len_off = if ty == Type::Short {
            None
        } else {
            let off = w.off();
            if w.put_varint_with_len(0, 2).is_err() {
                return Ok(None);
            }
            Some(off)
        };
        let pn_off = w.off();
        if w.put_zeroes(pn_len).is_err() || w.cap() < MIN_PN_AND_PAYLOAD {
            return Ok(None);
        }
        let payload_off = w.off();

        let mut frames = Vec::new();
        let mut close_sent = false;

        // ACK
        let space = &mut self.spaces[idx];
        if space.ack_pending && !zero_rtt {
            let delay = if epoch == Epoch::Application {
                now.saturating_sub(space.largest_rx_time) >> self.local_params.ack_delay_exponent
            } else {
                0
            };
            if let Some(ack) = AckFrame::from_ranges(&space.recv_pns, delay)
                && put_frame(&mut w, &Frame::Ack(ack))?
            {
                space.ack_pending = false;
            }
        }

        if closing {
            if let Some(err) = &self.local_error {
                // application close is not allowed before 1-RTT
                let (is_application, error_code, reason) = if err.is_app && epoch != Epoch::Application {
                    (false, TransportError::ApplicationError.to_code(), &[][..])
                } else {
                    (err.is_app, err.error_code, &err.reason[..])
                };
                let room = w.cap().saturating_sub(16);
                let frame = Frame::ConnectionClose(ConnectionCloseFrame {
                    is_application,
                    error_code,
                    frame_type: 0,
                    reason: &reason[..reason.len().min(room)],
                });
                close_sent = put_frame(&mut w, &frame)?;
            }
        } else {
            if epoch == Epoch::Application && !zero_rtt {
                if self.handshake_done_pending && put_frame(&mut w, &Frame::HandshakeDone)? {
                    self.handshake_done_pending = false;
                    frames.push(SentFrame::HandshakeDone);
                }
                if let Some(data) = self.path_response
                    && put_frame(&mut w, &Frame::PathResponse(data))?
                {
                    self.path_response = None;
                    frames.push(SentFrame::PathResponse);
                }
            }

            if epoch == Epoch::Application {
                self.write_flow_control(&mut w, &mut frames)?;
            }

            if !zero_rtt {
                let space = &mut self.spaces[idx];
                loop {
                    let overhead = frame::crypto_overhead(MAX_VARINT, w.cap());
                    if w.cap() <= overhead {
                        break;
                    }
                    let Some(chunk) = space.crypto_send.emit(w.cap() - overhead, u64::MAX) else {
                        break;
                    };
                    let (offset, len) = (chunk.offset, chunk.data.len() as u64);
                    frame::encode(&Frame::Crypto(CryptoFrame { offset, data: chunk.data }), &mut w)?;
                    frames.push(SentFrame::Crypto { offset, len });
                }
            }

            if epoch == Epoch::Application {
                self.write_stream_data(&mut w, &mut frames)?;
            }

            if self.spaces[idx].probe_pending && frames.is_empty() && put_frame(&mut w, &Frame::Ping)? {
                frames.push(SentFrame::Ping);
            }
        }

        if w.off() == payload_off {
            return Ok(None);
        }

        // PADDING so the header protection sample is available
        let min_end = pn_off + MIN_PN_AND_PAYLOAD;
        if w.off() < min_end {
            w.put_zeroes(min_end - w.off())?;
        }
        if ty == Type::Initial && (!self.is_server || !frames.is_empty()) {
            let target = MIN_CLIENT_INITIAL_LEN.saturating_sub(tag_len).min(cap);
            if w.off() < target {
                w.put_zeroes(target - w.off())?;
            }
        }
        let payload_end = w.off();

        if let Some(off) = len_off {
            let length = (payload_end - pn_off + tag_len) as u64;
            encode_varint_with_len(length, 2, &mut buf[off..off + 2])?;
        }

        let keys = self.seal_keys(epoch, zero_rtt).ok_or(Error::CryptoFail)?;
        let total = protection::seal(buf, pn_off, pn, pn_len, payload_end, keys)?;

        let space = &mut self.spaces[idx];
        space.next_pn += 1;
        space.probe_pending = false;
        trace!(trace_id = %self.trace_id, ?ty, pn, len = total, frames = frames.len(), "tx pkt");
        self.recovery.on_packet_sent(epoch, SentPacket::new(pn, now, total, frames), now);
        self.sent_count += 1;
        self.sent_bytes += total as u64;

        if close_sent {
            self.close_pending = false;
            self.state = ConnectionState::Closing;
            // resends do not extend the closing period
            let pto = self.recovery.pto();
            self.draining_timer.get_or_insert(now + 3 * pto);
        }

        // the client stops using Initial keys once it sends a Handshake packet
        if !self.is_server && epoch == Epoch::Handshake {
            self.discard_epoch(Epoch::Initial, now);
        }

        Ok(Some(total))
    }

    /// MAX_DATA, MAX_STREAMS and per-stream control frames.
    fn write_flow_control(&mut self, w: &mut Writer<'_>, frames: &mut Vec<SentFrame>) -> Result<(), Error> {
        let update = self.rx_data.should_update();
        if update || self.max_data_pending {
            let max = if update { self.rx_data.update() } else { self.rx_data.max_data() };
            self.max_data_pending = !put_frame(w, &Frame::MaxData(max))?;
            if !self.max_data_pending {
                frames.push(SentFrame::MaxData);
            }
        }

        for bidi in [true, false] {
            let idx = usize::from(!bidi);
            let update = self.streams.should_update_max_streams(bidi);
            if update || self.max_streams_pending[idx] {
                let max = if update {
                    self.streams.update_max_streams(bidi)
                } else {
                    self.streams.local_max_streams(bidi)
                };
                self.max_streams_pending[idx] = !put_frame(w, &Frame::MaxStreams { bidi, max })?;
                if !self.max_streams_pending[idx] {
                    frames.push(SentFrame::MaxStreams { bidi });
                }
            }
        }

        for id in self.streams.sendable() {
            let Some(s) = self.streams.get_mut(id) else {
                continue;
            };
            if let Some((error_code, final_size)) = s.reset_pending {
                let frame = Frame::ResetStream(ResetStreamFrame { stream_id: id, error_code, final_size });
                if put_frame(w, &frame)? {
                    s.reset_pending = None;
                    frames.push(SentFrame::ResetStream { id });
                }
            }
            if let Some(error_code) = s.stop_pending {
                let frame = Frame::StopSending(StopSendingFrame { stream_id: id, error_code });
                if put_frame(w, &frame)? {
                    s.stop_pending = None;
                    frames.push(SentFrame::StopSending { id });
                }
            }
            if s.max_data_pending {
                let max = s.recv_window.update();
                if put_frame(w, &Frame::MaxStreamData { stream_id: id, max })? {
                    s.max_data_pending = false;
                    frames.push(SentFrame::MaxStreamData { id });
                }
            }
        }
        Ok(())
    }

    /// STREAM frames, bounded by the congestion window.
    fn write_stream_data(&mut self, w: &mut Writer<'_>, frames: &mut Vec<SentFrame>) -> Result<(), Error> {
        let mut budget = self.recovery.cc.available_window();
        for id in self.streams.sendable() {
            let Some(s) = self.streams.get_mut(id) else {
                continue;
            };
            while budget > 0 {
                let overhead = frame::stream_overhead(id, MAX_VARINT, w.cap());
                if w.cap() <= overhead {
                    return Ok(());
                }
                let max_len = (w.cap() - overhead).min(usize::try_from(budget).unwrap_or(usize::MAX));
                let Some(chunk) = s.send.emit(max_len, u64::MAX) else {
                    break;
                };
                let (offset, len, fin) = (chunk.offset, chunk.data.len() as u64, chunk.fin);
                let frame = Frame::Stream(StreamFrame { stream_id: id, offset, data: chunk.data, fin });
                frame::encode(&frame, w)?;
                budget = budget.saturating_sub(len);
                frames.push(SentFrame::Stream { id, offset, len, fin });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use super::*;
    use crate::cid::ConnectionId;
    use crate::config::ConfigBuilder;
    use crate::connection::{accept, connect};
    use crate::transport::MICROS_PER_MILLI;

    fn established() -> (Connection, Connection, Instant) {
        crate::init().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
        let base = || ConfigBuilder::new(&[b"quay-test"]).unwrap().initial_max_data(100_000);
        let client_config = Arc::new(base().verify_peer(false).build().unwrap());
        let server_config =
            Arc::new(base().with_cert_chain_der(vec![cert.cert.der().clone()], key).build().unwrap());

        let client_addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let now = 1_000 * MICROS_PER_MILLI;
        let cid = |b: u8| ConnectionId::from_slice(&[b; 8]).unwrap();
        let mut client = connect("localhost", &cid(1), server_addr, client_config, now).unwrap();
        let mut server = accept(&cid(2), None, client_addr, server_config, now).unwrap();

        let mut buf = [0u8; 1350];
        for _ in 0..20 {
            let mut moved = false;
            while let Ok((n, _)) = client.send(&mut buf, now) {
                let _ = server.recv(&mut buf[..n], client_addr, now);
                moved = true;
            }
            while let Ok((n, _)) = server.send(&mut buf, now) {
                let _ = client.recv(&mut buf[..n], server_addr, now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
        assert!(client.is_established() && server.is_established());
        (client, server, now)
    }

    #[test]
    fn path_response_only_packet_is_ack_eliciting() {
        let (mut client, _server, now) = established();
        assert!(!client.recovery.has_ack_eliciting_in_flight(Epoch::Application));

        client.path_response = Some([0xab; 8]);
        let mut buf = [0u8; 1350];
        let (n, _) = client.send(&mut buf, now).unwrap();
        assert!(n > 0);
        assert!(client.path_response.is_none());
        assert!(client.recovery.has_ack_eliciting_in_flight(Epoch::Application));
        assert!(client.recovery.loss_detection_timer().is_some());
    }
}
