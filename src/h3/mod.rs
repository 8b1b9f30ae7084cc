//! HTTP/3 over a QUIC [`crate::Connection`] (RFC 9114).
//!
//! The HTTP/3 [`Connection`] owns no transport state. Every call takes the
//! QUIC connection it runs on, and [`Connection::poll`] turns stream data
//! into [`Event`]s:
//!
//! ```text
//! Headers* -> Data* -> Finished      (or Reset in place of Finished)
//! ```
//!
//! Field sections are compressed with static-table QPACK.

mod connection;
pub mod frame;
mod partial;
pub mod qpack;

pub use connection::Connection;
pub use partial::{PartialResponse, PartialResponses};

use std::fmt;

/// ALPN list in wire form, newest draft last.
pub const APPLICATION_PROTOCOL: &[u8] = b"\x02h3\x05h3-29\x05h3-28\x05h3-27";

/// ALPN list for [`crate::ConfigBuilder::new`].
pub const H3_ALPN: [&[u8]; 1] = [b"h3"];

pub(crate) const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub(crate) const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
pub(crate) const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

pub(crate) const STREAM_TYPE_CONTROL: u64 = 0x00;
pub(crate) const STREAM_TYPE_PUSH: u64 = 0x01;
pub(crate) const STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
pub(crate) const STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

/// HTTP/3 settings we advertise.
#[derive(Debug, Clone, Default)]
pub struct Config {
    max_field_section_size: Option<u64>,
    qpack_max_table_capacity: Option<u64>,
    qpack_blocked_streams: Option<u64>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest decoded field section we accept. Unlimited when unset.
    pub fn set_max_field_section_size(&mut self, v: u64) {
        self.max_field_section_size = Some(v);
    }

    /// Advertised QPACK dynamic table capacity. Only the static table is
    /// used, so a nonzero value lets a peer send references we reject.
    pub fn set_qpack_max_table_capacity(&mut self, v: u64) {
        self.qpack_max_table_capacity = Some(v);
    }

    pub fn set_qpack_blocked_streams(&mut self, v: u64) {
        self.qpack_blocked_streams = Some(v);
    }

    /// SETTINGS identifier/value pairs for the control stream.
    pub(crate) fn settings(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::with_capacity(3);
        if let Some(v) = self.max_field_section_size {
            out.push((SETTINGS_MAX_FIELD_SECTION_SIZE, v));
        }
        out.push((SETTINGS_QPACK_MAX_TABLE_CAPACITY, self.qpack_max_table_capacity.unwrap_or(0)));
        out.push((SETTINGS_QPACK_BLOCKED_STREAMS, self.qpack_blocked_streams.unwrap_or(0)));
        out
    }

    pub(crate) fn max_field_section_size(&self) -> u64 {
        self.max_field_section_size.unwrap_or(u64::MAX)
    }
}

/// A name/value field line.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Header(Vec<u8>, Vec<u8>);

impl Header {
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self(name.to_vec(), value.to_vec())
    }

    pub fn name(&self) -> &[u8] {
        &self.0
    }

    pub fn value(&self) -> &[u8] {
        &self.1
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", String::from_utf8_lossy(&self.0), String::from_utf8_lossy(&self.1))
    }
}

/// What [`Connection::poll`] reports for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A field section arrived. Reported once the next DATA frame or the
    /// FIN shows whether a body follows; `has_body` is false for the FIN.
    Headers { list: Vec<Header>, has_body: bool },

    /// Body bytes are ready for [`Connection::recv_body`]. Reported once
    /// until the buffered body has been drained.
    Data,

    /// The peer finished the stream and everything was delivered.
    Finished,

    /// The peer reset the stream with this error code.
    Reset(u64),

    /// The peer sent GOAWAY; the event's stream ID is the GOAWAY ID.
    GoAway,
}
