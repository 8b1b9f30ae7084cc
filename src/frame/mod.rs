/// QUIC frame codec (RFC 9000 sections 12.4, 19).
///
/// Pure encode/decode over [`Reader`]/[`Writer`] cursors. Frame data fields
/// borrow from the packet payload being parsed.
use crate::error::{Error, TransportError};
use crate::packet::Epoch;
use crate::transport::ranges::PnRanges;
use crate::varint::varint_len;
use crate::wire::{Reader, Writer};

/// Upper bound on ACK ranges accepted from the peer in one frame.
const MAX_ACK_RANGES: u64 = 256;

// ---------------------------------------------------------------------------
// Sub-structs
// ---------------------------------------------------------------------------

/// ACK frame with its ranges already expanded to inclusive `(lo, hi)` pairs,
/// highest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub ack_delay: u64,
    pub ranges: Vec<(u64, u64)>,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Build an ACK covering everything recorded in `ranges`.
    pub fn from_ranges(ranges: &PnRanges, ack_delay: u64) -> Option<Self> {
        let ranges: Vec<_> = ranges.iter_desc().collect();
        if ranges.is_empty() {
            return None;
        }
        Some(Self { ack_delay, ranges, ecn: None })
    }

    pub fn largest(&self) -> u64 {
        self.ranges.first().map_or(0, |r| r.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ecn_ce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: u64,
    pub error_code: u64,
    pub final_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: u64,
    pub error_code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: u64,
    pub offset: u64,
    pub data: &'a [u8],
    pub fin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame<'a> {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: &'a [u8],
    pub stateless_reset_token: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame<'a> {
    /// `true` for application close (0x1d), `false` for transport close (0x1c).
    pub is_application: bool,
    pub error_code: u64,
    /// Only carried by transport close.
    pub frame_type: u64,
    pub reason: &'a [u8],
}

// ---------------------------------------------------------------------------
// Frame enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A run of PADDING bytes, coalesced.
    Padding(usize),                                     // 0x00
    Ping,                                               // 0x01
    Ack(AckFrame),                                      // 0x02-0x03
    ResetStream(ResetStreamFrame),                      // 0x04
    StopSending(StopSendingFrame),                      // 0x05
    Crypto(CryptoFrame<'a>),                            // 0x06
    NewToken(&'a [u8]),                                 // 0x07
    Stream(StreamFrame<'a>),                            // 0x08-0x0f
    MaxData(u64),                                       // 0x10
    MaxStreamData { stream_id: u64, max: u64 },         // 0x11
    MaxStreams { bidi: bool, max: u64 },                // 0x12-0x13
    DataBlocked(u64),                                   // 0x14
    StreamDataBlocked { stream_id: u64, limit: u64 },   // 0x15
    StreamsBlocked { bidi: bool, limit: u64 },          // 0x16-0x17
    NewConnectionId(NewConnectionIdFrame<'a>),          // 0x18
    RetireConnectionId(u64),                            // 0x19
    PathChallenge([u8; 8]),                             // 0x1a
    PathResponse([u8; 8]),                              // 0x1b
    ConnectionClose(ConnectionCloseFrame<'a>),          // 0x1c-0x1d
    HandshakeDone,                                      // 0x1e
}

impl Frame<'_> {
    /// Whether receiving this frame obliges the peer to acknowledge it.
    pub fn ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_))
    }

    /// Whether the frame may appear in a packet of `epoch` (RFC 9000 §12.4).
    ///
    /// Initial and Handshake packets carry only PADDING, PING, ACK, CRYPTO
    /// and transport CONNECTION_CLOSE.
    pub fn allowed_in(&self, epoch: Epoch) -> bool {
        match epoch {
            Epoch::Application => true,
            Epoch::Initial | Epoch::Handshake => match self {
                Frame::Padding(_) | Frame::Ping | Frame::Ack(_) | Frame::Crypto(_) => true,
                Frame::ConnectionClose(c) => !c.is_application,
                _ => false,
            },
        }
    }

    /// Wire type of the frame, used in transport CONNECTION_CLOSE.
    pub fn type_code(&self) -> u64 {
        match self {
            Frame::Padding(_) => 0x00,
            Frame::Ping => 0x01,
            Frame::Ack(a) => 0x02 | u64::from(a.ecn.is_some()),
            Frame::ResetStream(_) => 0x04,
            Frame::StopSending(_) => 0x05,
            Frame::Crypto(_) => 0x06,
            Frame::NewToken(_) => 0x07,
            Frame::Stream(_) => 0x08,
            Frame::MaxData(_) => 0x10,
            Frame::MaxStreamData { .. } => 0x11,
            Frame::MaxStreams { bidi, .. } => if *bidi { 0x12 } else { 0x13 },
            Frame::DataBlocked(_) => 0x14,
            Frame::StreamDataBlocked { .. } => 0x15,
            Frame::StreamsBlocked { bidi, .. } => if *bidi { 0x16 } else { 0x17 },
            Frame::NewConnectionId(_) => 0x18,
            Frame::RetireConnectionId(_) => 0x19,
            Frame::PathChallenge(_) => 0x1a,
            Frame::PathResponse(_) => 0x1b,
            Frame::ConnectionClose(c) => if c.is_application { 0x1d } else { 0x1c },
            Frame::HandshakeDone => 0x1e,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn frame_encoding_error() -> Error {
    Error::Transport(TransportError::FrameEncodingError)
}

fn varint(r: &mut Reader<'_>) -> Result<u64, Error> {
    r.get_varint().map_err(|_| frame_encoding_error())
}

fn bytes<'a>(r: &mut Reader<'a>, len: u64) -> Result<&'a [u8], Error> {
    let len = usize::try_from(len).map_err(|_| frame_encoding_error())?;
    r.get_bytes(len).map_err(|_| frame_encoding_error())
}

fn array8(r: &mut Reader<'_>) -> Result<[u8; 8], Error> {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes(r, 8)?);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one QUIC frame from the reader.
pub fn decode<'a>(r: &mut Reader<'a>) -> Result<Frame<'a>, Error> {
    let frame_type = varint(r)?;

    let frame = match frame_type {
        0x00 => {
            let mut len = 1;
            while r.peek_u8().is_ok_and(|b| b == 0) {
                r.skip(1)?;
                len += 1;
            }
            Frame::Padding(len)
        }

        0x01 => Frame::Ping,

        0x02 | 0x03 => {
            let largest = varint(r)?;
            let ack_delay = varint(r)?;
            let range_count = varint(r)?;
            let first_range = varint(r)?;
            if range_count > MAX_ACK_RANGES || first_range > largest {
                return Err(frame_encoding_error());
            }

            let mut ranges = Vec::with_capacity(range_count as usize + 1);
            let mut lo = largest - first_range;
            ranges.push((lo, largest));
            for _ in 0..range_count {
                let gap = varint(r)?;
                let len = varint(r)?;
                // next range ends two below the previous smallest, minus the gap
                let hi = lo
                    .checked_sub(gap + 2)
                    .ok_or_else(frame_encoding_error)?;
                lo = hi.checked_sub(len).ok_or_else(frame_encoding_error)?;
                ranges.push((lo, hi));
            }

            let ecn = if frame_type == 0x03 {
                Some(EcnCounts { ect0: varint(r)?, ect1: varint(r)?, ecn_ce: varint(r)? })
            } else {
                None
            };

            Frame::Ack(AckFrame { ack_delay, ranges, ecn })
        }

        0x04 => Frame::ResetStream(ResetStreamFrame {
            stream_id: varint(r)?,
            error_code: varint(r)?,
            final_size: varint(r)?,
        }),

        0x05 => Frame::StopSending(StopSendingFrame {
            stream_id: varint(r)?,
            error_code: varint(r)?,
        }),

        0x06 => {
            let offset = varint(r)?;
            let len = varint(r)?;
            let data = bytes(r, len)?;
            if offset + data.len() as u64 > crate::varint::MAX_VARINT {
                return Err(frame_encoding_error());
            }
            Frame::Crypto(CryptoFrame { offset, data })
        }

        0x07 => {
            let len = varint(r)?;
            if len == 0 {
                return Err(frame_encoding_error());
            }
            Frame::NewToken(bytes(r, len)?)
        }

        0x08..=0x0f => {
            let stream_id = varint(r)?;
            let offset = if frame_type & 0x04 != 0 { varint(r)? } else { 0 };
            let data = if frame_type & 0x02 != 0 {
                let len = varint(r)?;
                bytes(r, len)?
            } else {
                r.rest()
            };
            if offset + data.len() as u64 > crate::varint::MAX_VARINT {
                return Err(Error::FlowControl);
            }
            Frame::Stream(StreamFrame { stream_id, offset, data, fin: frame_type & 0x01 != 0 })
        }

        0x10 => Frame::MaxData(varint(r)?),

        0x11 => Frame::MaxStreamData { stream_id: varint(r)?, max: varint(r)? },

        0x12 | 0x13 => {
            let max = varint(r)?;
            if max > 1 << 60 {
                return Err(frame_encoding_error());
            }
            Frame::MaxStreams { bidi: frame_type == 0x12, max }
        }

        0x14 => Frame::DataBlocked(varint(r)?),

        0x15 => Frame::StreamDataBlocked { stream_id: varint(r)?, limit: varint(r)? },

        0x16 | 0x17 => {
            let limit = varint(r)?;
            if limit > 1 << 60 {
                return Err(frame_encoding_error());
            }
            Frame::StreamsBlocked { bidi: frame_type == 0x16, limit }
        }

        0x18 => {
            let sequence_number = varint(r)?;
            let retire_prior_to = varint(r)?;
            let cid_len = r.get_u8().map_err(|_| frame_encoding_error())?;
            if cid_len == 0 || cid_len > 20 || retire_prior_to > sequence_number {
                return Err(frame_encoding_error());
            }
            let connection_id = bytes(r, u64::from(cid_len))?;
            let mut stateless_reset_token = [0u8; 16];
            stateless_reset_token.copy_from_slice(bytes(r, 16)?);
            Frame::NewConnectionId(NewConnectionIdFrame {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            })
        }

        0x19 => Frame::RetireConnectionId(varint(r)?),

        0x1a => Frame::PathChallenge(array8(r)?),

        0x1b => Frame::PathResponse(array8(r)?),

        0x1c | 0x1d => {
            let is_application = frame_type == 0x1d;
            let error_code = varint(r)?;
            let frame_type = if is_application { 0 } else { varint(r)? };
            let len = varint(r)?;
            let reason = bytes(r, len)?;
            Frame::ConnectionClose(ConnectionCloseFrame {
                is_application,
                error_code,
                frame_type,
                reason,
            })
        }

        0x1e => Frame::HandshakeDone,

        _ => return Err(frame_encoding_error()),
    };

    Ok(frame)
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Bytes [`encode`] will write for `frame`.
pub fn wire_len(frame: &Frame<'_>) -> usize {
    let v = varint_len;
    match frame {
        Frame::Padding(n) => *n,
        Frame::Ping | Frame::HandshakeDone => 1,
        Frame::Ack(a) => {
            let Some(&(lo, hi)) = a.ranges.first() else {
                return 0;
            };
            let mut len = 1 + v(hi) + v(a.ack_delay) + v(a.ranges.len() as u64 - 1);
            len += v(hi - lo);
            let mut prev_lo = lo;
            for &(lo, hi) in &a.ranges[1..] {
                len += v(prev_lo - hi - 2) + v(hi - lo);
                prev_lo = lo;
            }
            if let Some(e) = &a.ecn {
                len += v(e.ect0) + v(e.ect1) + v(e.ecn_ce);
            }
            len
        }
        Frame::ResetStream(f) => 1 + v(f.stream_id) + v(f.error_code) + v(f.final_size),
        Frame::StopSending(f) => 1 + v(f.stream_id) + v(f.error_code),
        Frame::Crypto(f) => 1 + v(f.offset) + v(f.data.len() as u64) + f.data.len(),
        Frame::NewToken(t) => 1 + v(t.len() as u64) + t.len(),
        Frame::Stream(f) => {
            stream_overhead(f.stream_id, f.offset, f.data.len()) + f.data.len()
        }
        Frame::MaxData(m) | Frame::DataBlocked(m) | Frame::RetireConnectionId(m) => 1 + v(*m),
        Frame::MaxStreamData { stream_id, max } => 1 + v(*stream_id) + v(*max),
        Frame::MaxStreams { max, .. } => 1 + v(*max),
        Frame::StreamDataBlocked { stream_id, limit } => 1 + v(*stream_id) + v(*limit),
        Frame::StreamsBlocked { limit, .. } => 1 + v(*limit),
        Frame::NewConnectionId(f) => {
            1 + v(f.sequence_number) + v(f.retire_prior_to) + 1 + f.connection_id.len() + 16
        }
        Frame::PathChallenge(_) | Frame::PathResponse(_) => 9,
        Frame::ConnectionClose(f) => {
            let ft = if f.is_application { 0 } else { v(f.frame_type) };
            1 + v(f.error_code) + ft + v(f.reason.len() as u64) + f.reason.len()
        }
    }
}

/// Bytes a STREAM frame spends before its data.
pub fn stream_overhead(stream_id: u64, offset: u64, len: usize) -> usize {
    let off = if offset > 0 { varint_len(offset) } else { 0 };
    1 + varint_len(stream_id) + off + varint_len(len as u64)
}

/// Bytes a CRYPTO frame spends before its data.
pub fn crypto_overhead(offset: u64, len: usize) -> usize {
    1 + varint_len(offset) + varint_len(len as u64)
}

/// Encode one QUIC frame.
pub fn encode(frame: &Frame<'_>, w: &mut Writer<'_>) -> Result<(), Error> {
    match frame {
        Frame::Padding(n) => w.put_zeroes(*n)?,

        Frame::Ping => w.put_varint(0x01)?,

        Frame::Ack(ack) => {
            let Some(&(first_lo, largest)) = ack.ranges.first() else {
                return Err(frame_encoding_error());
            };
            w.put_varint(frame.type_code())?;
            w.put_varint(largest)?;
            w.put_varint(ack.ack_delay)?;
            w.put_varint(ack.ranges.len() as u64 - 1)?;
            w.put_varint(largest - first_lo)?;
            let mut prev_lo = first_lo;
            for &(lo, hi) in &ack.ranges[1..] {
                w.put_varint(prev_lo - hi - 2)?;
                w.put_varint(hi - lo)?;
                prev_lo = lo;
            }
            if let Some(ecn) = &ack.ecn {
                w.put_varint(ecn.ect0)?;
                w.put_varint(ecn.ect1)?;
                w.put_varint(ecn.ecn_ce)?;
            }
        }

        Frame::ResetStream(f) => {
            w.put_varint(0x04)?;
            w.put_varint(f.stream_id)?;
            w.put_varint(f.error_code)?;
            w.put_varint(f.final_size)?;
        }

        Frame::StopSending(f) => {
            w.put_varint(0x05)?;
            w.put_varint(f.stream_id)?;
            w.put_varint(f.error_code)?;
        }

        Frame::Crypto(f) => {
            w.put_varint(0x06)?;
            w.put_varint(f.offset)?;
            w.put_varint(f.data.len() as u64)?;
            w.put_bytes(f.data)?;
        }

        Frame::NewToken(token) => {
            w.put_varint(0x07)?;
            w.put_varint(token.len() as u64)?;
            w.put_bytes(token)?;
        }

        Frame::Stream(f) => {
            // the length bit is always set so frames can share a packet
            let mut ty = 0x08 | 0x02;
            if f.offset > 0 {
                ty |= 0x04;
            }
            if f.fin {
                ty |= 0x01;
            }
            w.put_varint(ty)?;
            w.put_varint(f.stream_id)?;
            if f.offset > 0 {
                w.put_varint(f.offset)?;
            }
            w.put_varint(f.data.len() as u64)?;
            w.put_bytes(f.data)?;
        }

        Frame::MaxData(v) | Frame::DataBlocked(v) | Frame::RetireConnectionId(v) => {
            w.put_varint(frame.type_code())?;
            w.put_varint(*v)?;
        }

        Frame::MaxStreamData { stream_id, max: v }
        | Frame::StreamDataBlocked { stream_id, limit: v } => {
            w.put_varint(frame.type_code())?;
            w.put_varint(*stream_id)?;
            w.put_varint(*v)?;
        }

        Frame::MaxStreams { max: v, .. } | Frame::StreamsBlocked { limit: v, .. } => {
            w.put_varint(frame.type_code())?;
            w.put_varint(*v)?;
        }

        Frame::NewConnectionId(f) => {
            w.put_varint(0x18)?;
            w.put_varint(f.sequence_number)?;
            w.put_varint(f.retire_prior_to)?;
            w.put_u8(f.connection_id.len() as u8)?;
            w.put_bytes(f.connection_id)?;
            w.put_bytes(&f.stateless_reset_token)?;
        }

        Frame::PathChallenge(data) | Frame::PathResponse(data) => {
            w.put_varint(frame.type_code())?;
            w.put_bytes(data)?;
        }

        Frame::ConnectionClose(f) => {
            w.put_varint(frame.type_code())?;
            w.put_varint(f.error_code)?;
            if !f.is_application {
                w.put_varint(f.frame_type)?;
            }
            w.put_varint(f.reason.len() as u64)?;
            w.put_bytes(f.reason)?;
        }

        Frame::HandshakeDone => w.put_varint(0x1e)?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
