//! HTTP/3 connection state: critical streams, SETTINGS exchange and request
//! stream framing.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::{debug, trace, warn};

use super::frame::{self, Frame};
use super::qpack;
use super::{
    Config, Event, Header, SETTINGS_MAX_FIELD_SECTION_SIZE, STREAM_TYPE_CONTROL, STREAM_TYPE_PUSH,
    STREAM_TYPE_QPACK_DECODER, STREAM_TYPE_QPACK_ENCODER,
};
use crate::connection::Shutdown;
use crate::error::{Error, H3Error};
use crate::transport::stream::{is_bidirectional, is_client_initiated, is_local};
use crate::varint::{decode_varint, push_varint};

/// Largest non-DATA frame payload we buffer before giving up.
const MAX_FRAME_PAYLOAD: u64 = 64 * 1024;

/// Stop pulling request data from the transport once this much body is
/// waiting for the application.
const BODY_HIGH_WATER: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Close the QUIC connection with an HTTP/3 error and hand the error back.
fn close_with(quic: &mut crate::Connection, err: H3Error, reason: &str) -> Error {
    warn!(trace_id = %quic.trace_id(), ?err, reason, "h3 connection error");
    let _ = quic.close(true, err.to_code(), reason.as_bytes());
    Error::Http3(err)
}

/// Protocol errors reported while parsing a frame become connection
/// errors; anything else is passed through.
fn close_on_h3(quic: &mut crate::Connection, err: Error) -> Error {
    match err {
        Error::Http3(code) => close_with(quic, code, "malformed frame"),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UniKind {
    /// Stream type not read yet.
    Pending,
    Control,
    QpackEncoder,
    QpackDecoder,
    /// Unknown type; reading was stopped.
    Ignored,
}

impl UniKind {
    fn is_critical(self) -> bool {
        matches!(self, UniKind::Control | UniKind::QpackEncoder | UniKind::QpackDecoder)
    }
}

#[derive(Debug)]
struct UniStream {
    kind: UniKind,
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    FrameHeader,
    /// Inside a DATA payload.
    Data(u64),
    /// Inside the payload of an unknown frame.
    Skip(u64),
}

#[derive(Debug)]
struct RequestStream {
    buf: Vec<u8>,
    state: RecvState,
    headers_received: bool,
    /// Decoded fields held back until a DATA frame or the FIN shows whether
    /// a body follows.
    pending_headers: Option<Vec<Header>>,
    body: Vec<u8>,
    /// A `Data` event was queued and the body has not been drained since.
    data_reported: bool,
    fin: bool,
}

impl RequestStream {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: RecvState::FrameHeader,
            headers_received: false,
            pending_headers: None,
            body: Vec::new(),
            data_reported: false,
            fin: false,
        }
    }

    /// Everything up to the FIN was parsed and handed out.
    fn is_finished(&self) -> bool {
        self.fin
            && self.buf.is_empty()
            && self.body.is_empty()
            && self.pending_headers.is_none()
            && self.state == RecvState::FrameHeader
    }

    /// Queue the held-back field section, if any.
    fn release_headers(&mut self, stream_id: u64, has_body: bool, events: &mut VecDeque<(u64, Event)>) {
        if let Some(list) = self.pending_headers.take() {
            events.push_back((stream_id, Event::Headers { list, has_body }));
        }
    }
}

/// An HTTP/3 connection layered on a QUIC connection.
pub struct Connection {
    is_server: bool,

    control_stream_id: u64,
    encoder_stream_id: u64,
    decoder_stream_id: u64,

    peer_control_stream_id: Option<u64>,
    peer_encoder_stream_id: Option<u64>,
    peer_decoder_stream_id: Option<u64>,

    peer_settings: Option<Vec<(u64, u64)>>,
    peer_max_field_section_size: Option<u64>,

    encoder: qpack::Encoder,
    decoder: qpack::Decoder,

    uni_streams: BTreeMap<u64, UniStream>,
    streams: BTreeMap<u64, RequestStream>,
    /// Streams we may still send DATA on: headers sent, no FIN yet.
    sendable: HashSet<u64>,

    next_request_id: u64,

    local_goaway_id: Option<u64>,
    peer_goaway_id: Option<u64>,

    events: VecDeque<(u64, Event)>,
}

impl Connection {
    /// Start HTTP/3 on `quic`: open our control stream with SETTINGS, and
    /// the QPACK encoder and decoder streams.
    ///
    /// The QUIC connection must be established or in early data.
    pub fn with_transport(quic: &mut crate::Connection, config: &Config) -> Result<Self, Error> {
        if !(quic.is_established() || quic.is_in_early_data()) {
            return Err(Error::InvalidState);
        }

        let is_server = quic.is_server();
        // first unidirectional stream IDs: 2 for clients, 3 for servers
        let uni_base = if is_server { 3 } else { 2 };

        let conn = Connection {
            is_server,
            control_stream_id: uni_base,
            encoder_stream_id: uni_base + 4,
            decoder_stream_id: uni_base + 8,
            peer_control_stream_id: None,
            peer_encoder_stream_id: None,
            peer_decoder_stream_id: None,
            peer_settings: None,
            peer_max_field_section_size: None,
            encoder: qpack::Encoder::new(),
            decoder: qpack::Decoder::new(config.max_field_section_size()),
            uni_streams: BTreeMap::new(),
            streams: BTreeMap::new(),
            sendable: HashSet::new(),
            next_request_id: 0,
            local_goaway_id: None,
            peer_goaway_id: None,
            events: VecDeque::new(),
        };

        let mut settings = Vec::new();
        Frame::Settings(config.settings()).encode(&mut settings);
        Self::open_uni(quic, conn.control_stream_id, STREAM_TYPE_CONTROL, &settings)?;
        Self::open_uni(quic, conn.encoder_stream_id, STREAM_TYPE_QPACK_ENCODER, &[])?;
        Self::open_uni(quic, conn.decoder_stream_id, STREAM_TYPE_QPACK_DECODER, &[])?;

        debug!(trace_id = %quic.trace_id(), is_server, "h3 streams opened");
        Ok(conn)
    }

    fn open_uni(quic: &mut crate::Connection, id: u64, ty: u64, body: &[u8]) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(1 + body.len());
        push_varint(ty, &mut buf);
        buf.extend_from_slice(body);
        if quic.stream_send(id, &buf, false)? != buf.len() {
            return Err(Error::StreamBlocked);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Open a request stream and send `headers` on it. With `fin` the
    /// request has no body.
    pub fn send_request(
        &mut self,
        quic: &mut crate::Connection,
        headers: &[Header],
        fin: bool,
    ) -> Result<u64, Error> {
        if self.is_server {
            return Err(Error::InvalidState);
        }
        let stream_id = self.next_request_id;
        if self.peer_goaway_id.is_some_and(|goaway| stream_id >= goaway) {
            return Err(Error::Http3(H3Error::RequestRejected));
        }

        // creates the stream so that its capacity can be checked
        quic.stream_send(stream_id, b"", false)?;
        self.send_headers(quic, stream_id, headers, fin)?;

        self.next_request_id += 4;
        self.streams.insert(stream_id, RequestStream::new());
        trace!(trace_id = %quic.trace_id(), stream_id, fin, "request sent");
        Ok(stream_id)
    }

    /// Send response `headers` on a request stream.
    pub fn send_response(
        &mut self,
        quic: &mut crate::Connection,
        stream_id: u64,
        headers: &[Header],
        fin: bool,
    ) -> Result<(), Error> {
        self.send_headers(quic, stream_id, headers, fin)
    }

    fn send_headers(
        &mut self,
        quic: &mut crate::Connection,
        stream_id: u64,
        headers: &[Header],
        fin: bool,
    ) -> Result<(), Error> {
        if let Some(max) = self.peer_max_field_section_size {
            let size: u64 = headers.iter().map(|h| (h.name().len() + h.value().len()) as u64 + 32).sum();
            if size > max {
                return Err(Error::Http3(H3Error::ExcessiveLoad));
            }
        }

        let block = self.encoder.encode(headers);
        let mut buf = Vec::with_capacity(block.len() + 4);
        Frame::Headers(&block).encode(&mut buf);

        if quic.stream_capacity(stream_id)? < buf.len() {
            return Err(Error::StreamBlocked);
        }
        quic.stream_send(stream_id, &buf, fin)?;

        if fin {
            self.sendable.remove(&stream_id);
        } else {
            self.sendable.insert(stream_id);
        }
        Ok(())
    }

    /// Send body bytes as one DATA frame.
    ///
    /// Returns how many bytes of `body` were sent, which may be fewer than
    /// offered; `fin` only applies when all of it fit. Fails with
    /// `StreamBlocked` when not even a one-byte frame fits.
    pub fn send_body(
        &mut self,
        quic: &mut crate::Connection,
        stream_id: u64,
        body: &[u8],
        fin: bool,
    ) -> Result<usize, Error> {
        if !self.sendable.contains(&stream_id) {
            return Err(Error::Http3(H3Error::FrameUnexpected));
        }
        if body.is_empty() {
            if !fin {
                return Err(Error::Done);
            }
            quic.stream_send(stream_id, b"", true)?;
            self.sendable.remove(&stream_id);
            return Ok(0);
        }

        let capacity = quic.stream_capacity(stream_id)?;
        let most = body.len().min(capacity);
        let n = most.min(capacity.saturating_sub(frame::data_header_len(most)));
        if n == 0 {
            return Err(Error::StreamBlocked);
        }
        let fin = fin && n == body.len();

        let mut buf = Vec::with_capacity(n + 9);
        frame::data_header(n, &mut buf);
        buf.extend_from_slice(&body[..n]);
        quic.stream_send(stream_id, &buf, fin)?;

        if fin {
            self.sendable.remove(&stream_id);
        }
        trace!(trace_id = %quic.trace_id(), stream_id, n, fin, "body sent");
        Ok(n)
    }

    /// Start a graceful shutdown. A server passes the first request stream
    /// it will not process; IDs may only stay the same or decrease.
    pub fn send_goaway(&mut self, quic: &mut crate::Connection, id: u64) -> Result<(), Error> {
        if self.is_server && !(is_bidirectional(id) && is_client_initiated(id)) {
            return Err(Error::Http3(H3Error::IdError));
        }
        if self.local_goaway_id.is_some_and(|prev| id > prev) {
            return Err(Error::Http3(H3Error::IdError));
        }

        let mut buf = Vec::new();
        Frame::GoAway(id).encode(&mut buf);
        quic.stream_send(self.control_stream_id, &buf, false)?;
        self.local_goaway_id = Some(id);
        debug!(trace_id = %quic.trace_id(), id, "goaway sent");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Next HTTP/3 event, or `Done` when there is nothing to report.
    ///
    /// Protocol violations close the QUIC connection and are returned as
    /// `Error::Http3`.
    pub fn poll(&mut self, quic: &mut crate::Connection) -> Result<(u64, Event), Error> {
        if let Some(ev) = self.events.pop_front() {
            return Ok(ev);
        }

        let (request, uni): (Vec<u64>, Vec<u64>) = quic.readable().partition(|&id| is_bidirectional(id));
        // critical streams first, so SETTINGS precede request processing
        for id in uni {
            self.process_uni(quic, id)?;
        }
        for id in request {
            self.process_request(quic, id)?;
        }
        self.report_finished();

        self.events.pop_front().ok_or(Error::Done)
    }

    /// Read buffered body bytes into `out`. Fails with `Done` when none
    /// are ready.
    pub fn recv_body(&mut self, quic: &mut crate::Connection, stream_id: u64, out: &mut [u8]) -> Result<usize, Error> {
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::Done)?;
        if stream.body.is_empty() {
            return Err(Error::Done);
        }

        let n = out.len().min(stream.body.len());
        out[..n].copy_from_slice(&stream.body[..n]);
        stream.body.drain(..n);

        if stream.body.is_empty() {
            stream.data_reported = false;
            // more may have been held back by the high-water mark
            self.process_request(quic, stream_id)?;
        }
        Ok(n)
    }

    /// Identifier/value pairs of the peer's SETTINGS, once received.
    pub fn peer_settings_raw(&self) -> Option<&[(u64, u64)]> {
        self.peer_settings.as_deref()
    }

    /// Pull readable bytes of `stream_id` into `buf`. Returns whether the
    /// FIN was read, or the reset code if the peer reset the stream.
    fn read_stream(
        quic: &mut crate::Connection,
        stream_id: u64,
        buf: &mut Vec<u8>,
        limit: usize,
    ) -> Result<Result<bool, u64>, Error> {
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < limit {
            match quic.stream_recv(stream_id, &mut chunk) {
                Ok((n, fin)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if fin {
                        return Ok(Ok(true));
                    }
                }
                Err(Error::Done) => break,
                Err(Error::StreamReset(_, code)) => return Ok(Err(code)),
                Err(e) => return Err(e),
            }
        }
        Ok(Ok(false))
    }

    fn process_uni(&mut self, quic: &mut crate::Connection, stream_id: u64) -> Result<(), Error> {
        let stream = self
            .uni_streams
            .entry(stream_id)
            .or_insert_with(|| UniStream { kind: UniKind::Pending, buf: Vec::new() });

        let outcome = Self::read_stream(quic, stream_id, &mut stream.buf, usize::MAX)?;
        let closed = !matches!(outcome, Ok(false));

        if stream.kind == UniKind::Pending {
            let Ok((ty, n)) = decode_varint(&stream.buf) else {
                if closed {
                    self.uni_streams.remove(&stream_id);
                }
                return Ok(());
            };
            stream.buf.drain(..n);
            stream.kind = match ty {
                STREAM_TYPE_CONTROL => UniKind::Control,
                STREAM_TYPE_QPACK_ENCODER => UniKind::QpackEncoder,
                STREAM_TYPE_QPACK_DECODER => UniKind::QpackDecoder,
                STREAM_TYPE_PUSH if self.is_server => {
                    return Err(close_with(quic, H3Error::StreamCreationError, "push stream from client"));
                }
                // we never send MAX_PUSH_ID, so no push ID is valid
                STREAM_TYPE_PUSH => return Err(close_with(quic, H3Error::IdError, "unexpected push")),
                _ => UniKind::Ignored,
            };

            let slot = match stream.kind {
                UniKind::Control => Some(&mut self.peer_control_stream_id),
                UniKind::QpackEncoder => Some(&mut self.peer_encoder_stream_id),
                UniKind::QpackDecoder => Some(&mut self.peer_decoder_stream_id),
                _ => None,
            };
            if let Some(slot) = slot {
                if slot.is_some() {
                    return Err(close_with(quic, H3Error::StreamCreationError, "duplicate critical stream"));
                }
                *slot = Some(stream_id);
            }
            trace!(trace_id = %quic.trace_id(), stream_id, ty, "peer uni stream");

            if stream.kind == UniKind::Ignored {
                stream.buf.clear();
                let _ = quic.stream_shutdown(
                    stream_id,
                    Shutdown::Read,
                    H3Error::StreamCreationError.to_code(),
                );
            }
        }

        if stream.kind.is_critical() && closed {
            return Err(close_with(quic, H3Error::ClosedCriticalStream, "critical stream closed"));
        }

        let kind = stream.kind;
        match kind {
            UniKind::Control => self.process_control(quic, stream_id),
            UniKind::QpackEncoder | UniKind::QpackDecoder => {
                // no dynamic table, so instructions carry nothing we use
                stream.buf.clear();
                Ok(())
            }
            UniKind::Ignored if closed => {
                self.uni_streams.remove(&stream_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process_control(&mut self, quic: &mut crate::Connection, stream_id: u64) -> Result<(), Error> {
        loop {
            let Some(stream) = self.uni_streams.get_mut(&stream_id) else {
                return Ok(());
            };
            let Some((ty, len, hdr)) = frame::parse_header(&stream.buf) else {
                return Ok(());
            };
            if len > MAX_FRAME_PAYLOAD {
                return Err(close_with(quic, H3Error::ExcessiveLoad, "control frame too large"));
            }
            let total = hdr + len as usize;
            if stream.buf.len() < total {
                return Ok(());
            }
            let raw: Vec<u8> = stream.buf.drain(..total).collect();
            let frame = Frame::from_payload(ty, &raw[hdr..]).map_err(|e| close_on_h3(quic, e))?;

            if self.peer_settings.is_none() && !matches!(frame, Frame::Settings(_)) {
                return Err(close_with(quic, H3Error::MissingSettings, "first control frame"));
            }

            match frame {
                Frame::Settings(settings) => {
                    if self.peer_settings.is_some() {
                        return Err(close_with(quic, H3Error::FrameUnexpected, "repeated SETTINGS"));
                    }
                    self.peer_max_field_section_size = settings
                        .iter()
                        .find(|(id, _)| *id == SETTINGS_MAX_FIELD_SECTION_SIZE)
                        .map(|&(_, v)| v);
                    debug!(trace_id = %quic.trace_id(), ?settings, "peer settings");
                    self.peer_settings = Some(settings);
                }
                Frame::GoAway(id) => {
                    if !self.is_server && !(is_bidirectional(id) && is_client_initiated(id)) {
                        return Err(close_with(quic, H3Error::IdError, "GOAWAY stream ID"));
                    }
                    if self.peer_goaway_id.is_some_and(|prev| id > prev) {
                        return Err(close_with(quic, H3Error::IdError, "GOAWAY ID increased"));
                    }
                    self.peer_goaway_id = Some(id);
                    self.events.push_back((id, Event::GoAway));
                }
                Frame::MaxPushId(_) if !self.is_server => {
                    return Err(close_with(quic, H3Error::FrameUnexpected, "MAX_PUSH_ID to client"));
                }
                Frame::MaxPushId(_) | Frame::CancelPush(_) | Frame::Unknown(_) => {}
                Frame::Data(_) | Frame::Headers(_) | Frame::PushPromise { .. } => {
                    return Err(close_with(quic, H3Error::FrameUnexpected, "request frame on control stream"));
                }
            }
        }
    }

    fn process_request(&mut self, quic: &mut crate::Connection, stream_id: u64) -> Result<(), Error> {
        if !self.streams.contains_key(&stream_id) {
            if !is_local(stream_id, !self.is_server) && !self.is_server {
                return Err(close_with(quic, H3Error::StreamCreationError, "server-initiated bidi stream"));
            }
            if self.local_goaway_id.is_some_and(|goaway| stream_id >= goaway) {
                let code = H3Error::RequestRejected.to_code();
                let _ = quic.stream_shutdown(stream_id, Shutdown::Read, code);
                let _ = quic.stream_shutdown(stream_id, Shutdown::Write, code);
                debug!(trace_id = %quic.trace_id(), stream_id, "request after goaway rejected");
                return Ok(());
            }
            self.streams.insert(stream_id, RequestStream::new());
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if stream.fin || stream.body.len() >= BODY_HIGH_WATER {
            return Ok(());
        }

        let limit = stream.buf.len() + BODY_HIGH_WATER;
        match Self::read_stream(quic, stream_id, &mut stream.buf, limit)? {
            Ok(fin) => stream.fin = fin,
            Err(code) => {
                self.streams.remove(&stream_id);
                self.sendable.remove(&stream_id);
                self.events.push_back((stream_id, Event::Reset(code)));
                return Ok(());
            }
        }

        self.parse_request(quic, stream_id)
    }

    fn parse_request(&mut self, quic: &mut crate::Connection, stream_id: u64) -> Result<(), Error> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        loop {
            match stream.state {
                RecvState::Data(remaining) => {
                    if stream.buf.is_empty() {
                        break;
                    }
                    let n = stream.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    stream.body.extend(stream.buf.drain(..n));
                    let left = remaining - n as u64;
                    stream.state = if left == 0 { RecvState::FrameHeader } else { RecvState::Data(left) };
                    if !stream.data_reported {
                        stream.data_reported = true;
                        self.events.push_back((stream_id, Event::Data));
                    }
                }
                RecvState::Skip(remaining) => {
                    if stream.buf.is_empty() {
                        break;
                    }
                    let n = stream.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    stream.buf.drain(..n);
                    let left = remaining - n as u64;
                    stream.state = if left == 0 { RecvState::FrameHeader } else { RecvState::Skip(left) };
                }
                RecvState::FrameHeader => {
                    let Some((ty, len, hdr)) = frame::parse_header(&stream.buf) else {
                        break;
                    };
                    match ty {
                        frame::DATA => {
                            if !stream.headers_received {
                                return Err(close_with(quic, H3Error::FrameUnexpected, "DATA before HEADERS"));
                            }
                            stream.release_headers(stream_id, true, &mut self.events);
                            stream.buf.drain(..hdr);
                            if len > 0 {
                                stream.state = RecvState::Data(len);
                            }
                        }
                        frame::HEADERS
                        | frame::CANCEL_PUSH
                        | frame::SETTINGS
                        | frame::PUSH_PROMISE
                        | frame::GOAWAY
                        | frame::MAX_PUSH_ID => {
                            if len > MAX_FRAME_PAYLOAD {
                                return Err(close_with(quic, H3Error::ExcessiveLoad, "frame too large"));
                            }
                            let total = hdr + len as usize;
                            if stream.buf.len() < total {
                                break;
                            }
                            let raw: Vec<u8> = stream.buf.drain(..total).collect();
                            let frame = Frame::from_payload(ty, &raw[hdr..]).map_err(|e| close_on_h3(quic, e))?;

                            let Frame::Headers(block) = frame else {
                                return Err(close_with(quic, H3Error::FrameUnexpected, "frame on request stream"));
                            };
                            let list = match self.decoder.decode(block) {
                                Ok(list) => list,
                                Err(Error::Http3(H3Error::ExcessiveLoad)) => {
                                    let code = H3Error::ExcessiveLoad.to_code();
                                    let _ = quic.stream_shutdown(stream_id, Shutdown::Read, code);
                                    let _ = quic.stream_shutdown(stream_id, Shutdown::Write, code);
                                    self.streams.remove(&stream_id);
                                    self.sendable.remove(&stream_id);
                                    debug!(trace_id = %quic.trace_id(), stream_id, "field section too large");
                                    return Ok(());
                                }
                                Err(e) => return Err(close_on_h3(quic, e)),
                            };
                            // a second field section is the trailer, so nothing came between
                            stream.release_headers(stream_id, false, &mut self.events);
                            stream.headers_received = true;
                            trace!(trace_id = %quic.trace_id(), stream_id, fields = list.len(), "headers");
                            stream.pending_headers = Some(list);
                        }
                        _ => {
                            stream.buf.drain(..hdr);
                            if len > 0 {
                                stream.state = RecvState::Skip(len);
                            }
                        }
                    }
                }
            }
        }

        if stream.fin && !(stream.buf.is_empty() && stream.state == RecvState::FrameHeader) {
            return Err(close_with(quic, H3Error::FrameError, "stream ended inside a frame"));
        }
        if stream.fin {
            stream.release_headers(stream_id, false, &mut self.events);
        }
        Ok(())
    }

    /// Queue `Finished` for streams whose FIN was reached and whose body was
    /// fully drained.
    fn report_finished(&mut self) {
        let done: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_finished())
            .map(|(&id, _)| id)
            .collect();
        for id in done {
            self.streams.remove(&id);
            self.events.push_back((id, Event::Finished));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("h3::Connection")
            .field("is_server", &self.is_server)
            .field("control_stream_id", &self.control_stream_id)
            .field("peer_control_stream_id", &self.peer_control_stream_id)
            .field("streams", &self.streams.len())
            .field("events", &self.events.len())
            .finish()
    }
}
